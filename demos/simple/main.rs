use std::time::Duration;

use futures::StreamExt;

#[tokio::main]
pub async fn main() -> edge_proxy::Result<()> {
    env_logger::init();

    let api_url = std::env::var("UPSTREAM_API_URL").unwrap();
    let api_token = std::env::var("UPSTREAM_API_TOKEN").unwrap();
    let keys = std::env::var("ENVIRONMENT_API_KEYS").unwrap();

    let proxy = edge_proxy::ProxyConfig::new(api_url, api_token)
        .environment_keys(keys.split(',').map(str::trim))
        .poll_interval(Duration::from_secs(10))
        .to_proxy()?;

    // Start refreshing in the background. Until the first refresh completes, every read fails with
    // `Error::NotYetFetched`.
    let refresher = proxy.start_refresher();
    refresher.wait_for_first_refresh().await?;

    for key in proxy.store().keys() {
        match proxy.get_environment(key) {
            Ok(document) => println!("{key}: {}", document.fingerprint),
            Err(err) => println!("{key}: {err}"),
        }
    }

    let mut changes = proxy.subscribe();
    tokio::select! {
        _ = async {
            while let Some(event) = changes.next().await {
                println!("{} changed: {}", event.key, serde_json::to_string(&event).unwrap());
            }
        } => Ok(()),
        // Resolves only if the upstream stopped answering altogether.
        result = refresher.wait() => result,
    }
}
