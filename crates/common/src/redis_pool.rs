use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager shared by the task queue and rate limiter.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!(redis_url = %redact(redis_url), "Connected to Redis");
    Ok(manager)
}

/// Strip credentials from a redis URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
