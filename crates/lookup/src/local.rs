//! Local lookup: adapts the cache to the [`Lookup`] interface.

use crate::{query, Lookup, LookupResponse, QueryResult, SingleLookupResult};
use silo_cache::KeyValueCache;
use silo_common::{Error, LookupStatus};
use std::sync::Arc;

pub struct LocalLookup {
    cache: Arc<KeyValueCache>,
}

impl LocalLookup {
    pub fn new(cache: Arc<KeyValueCache>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl Lookup for LocalLookup {
    async fn get_key_values(&self, keys: Vec<String>) -> Result<LookupResponse, Error> {
        let found = self.cache.get(&keys);
        let m = silo_metrics::metrics();
        if found.is_empty() && !keys.is_empty() {
            m.cache_key_misses.inc();
        } else {
            m.cache_key_hits.inc();
        }

        let mut response = LookupResponse::default();
        for key in keys {
            if response.kv_pairs.contains_key(&key) {
                continue;
            }
            let result = match found.get(&key) {
                Some(value) => SingleLookupResult::Value(value.clone()),
                None => SingleLookupResult::Status(LookupStatus::not_found(&key)),
            };
            response.kv_pairs.insert(key, result);
        }
        Ok(response)
    }

    async fn get_key_value_set(&self, keys: Vec<String>) -> Result<LookupResponse, Error> {
        let found = self.cache.get_sets(&keys);
        let mut response = LookupResponse::default();
        for key in keys {
            if response.kv_pairs.contains_key(&key) {
                continue;
            }
            let result = match found.get(&key) {
                Some(elements) => {
                    let mut elements: Vec<String> = elements.iter().cloned().collect();
                    elements.sort();
                    SingleLookupResult::ValueSet(elements)
                }
                None => SingleLookupResult::Status(LookupStatus::not_found(&key)),
            };
            response.kv_pairs.insert(key, result);
        }
        Ok(response)
    }

    async fn run_query(&self, query: String) -> Result<QueryResult, Error> {
        let ast = query::parse(&query)?;
        let cache = &self.cache;
        let result = ast.eval(&|key| {
            cache
                .get_sets(&[key])
                .remove(key)
                .unwrap_or_default()
        });
        Ok(QueryResult::from_set(result))
    }
}
