use redis::{Client, aio::MultiplexedConnection};
use tracing::info;

#[derive(Clone)]
pub struct Redis {
    pub client: Client,
    pub connection: MultiplexedConnection,
}

impl Redis {
    /// Connects and verifies the broker with a PING before handing the
    /// multiplexed connection out.
    pub async fn new(url: &str) -> Result<Self, redis::RedisError> {
        let client = Client::open(url)?;
        let mut connection = client.get_multiplexed_tokio_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut connection).await?;
        info!("✅ Connected to Redis");

        Ok(Self { client, connection })
    }
}
