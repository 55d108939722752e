use tokio::{io::BufReader, net::TcpStream, time::timeout};
use tracing::debug;

use crate::{
    config::{BackendKind, ConfigError, RemoteBackendConfig},
    link::{link_runtime, Link, LinkPool},
    pool::PoolError,
};

/// Opens `connections` links spread round-robin over the configured worker
/// addresses and waits for each to announce itself.
///
/// A worker service handles every connection independently, so opening more
/// connections than addresses raises the concurrency per node.
pub fn connect_remote_pool<I, O>(
    config: &RemoteBackendConfig,
    connections: usize,
    expect_model: Option<&str>,
) -> Result<LinkPool<I, O>, PoolError> {
    if config.workers.is_empty() {
        return Err(
            ConfigError::Invalid("remote backend needs at least one worker address".into()).into(),
        );
    }
    if connections == 0 {
        return Err(ConfigError::Invalid("n_jobs must be at least 1".into()).into());
    }
    let wait = config.connect_timeout();
    let runtime = link_runtime()?;
    let links = runtime.block_on(async {
        let mut links = Vec::with_capacity(connections);
        for slot in 0..connections {
            let address = &config.workers[slot % config.workers.len()];
            let stream = match timeout(wait, TcpStream::connect(address.as_str())).await {
                Err(_) => {
                    return Err(PoolError::Connect {
                        address: address.clone(),
                        reason: format!("timed out after {wait:?}"),
                    })
                }
                Ok(Err(err)) => {
                    return Err(PoolError::Connect {
                        address: address.clone(),
                        reason: err.to_string(),
                    })
                }
                Ok(Ok(stream)) => stream,
            };
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            let mut link = Link::new(
                format!("{address}#{slot}"),
                Box::new(BufReader::new(reader)),
                Box::new(writer),
                None,
            );
            link.handshake(expect_model, wait).await?;
            debug!(%address, slot, "connected to worker");
            links.push(link);
        }
        Ok::<_, PoolError>(links)
    })?;
    Ok(LinkPool::start(BackendKind::Remote, runtime, links))
}
