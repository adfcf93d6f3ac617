use std::sync::Arc;

use proxy_clap_blocks::store::StoreConfig;
use proxy_config_store::ConsulStore;

/// A client of the Consul agent named in `config`
pub(crate) fn consul_store(config: &StoreConfig) -> Result<Arc<ConsulStore>, proxy_config_store::Error> {
    let mut store = ConsulStore::new(config.consul_address.as_str())?;
    if let Some(token) = &config.consul_acl_token {
        store = store.with_acl_token(token.as_str());
    }
    Ok(Arc::new(store))
}
