use std::fmt;
use std::time::Duration;

use http::HeaderValue;
use tracing::{debug, trace, warn};

use super::auth::{BasicCredentials, CredentialStore};
use super::conn::{TcpConfig, TcpTransport, Transport};
use super::pool::{Config, Pool};
use super::Client;

/// A builder for a client.
pub struct Builder<T = TcpTransport> {
    transport: T,
    config: Config,
    credentials: Box<dyn CredentialStore>,
    reap_idle: Option<Duration>,
}

impl<T: fmt::Debug> fmt::Debug for Builder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .field("reap_idle", &self.reap_idle)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Create a builder with the default configuration and a TCP transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the provided TCP configuration.
    pub fn with_tcp(self, config: TcpConfig) -> Builder<TcpTransport> {
        self.with_transport(TcpTransport::new(config))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            transport: TcpTransport::default(),
            config: Config::default(),
            credentials: Box::new(BasicCredentials::new()),
            reap_idle: None,
        }
    }
}

impl<T> Builder<T> {
    /// Provide a custom transport.
    pub fn with_transport<T2>(self, transport: T2) -> Builder<T2> {
        Builder {
            transport,
            config: self.config,
            credentials: self.credentials,
            reap_idle: self.reap_idle,
        }
    }

    /// Get a mutable reference to the transport.
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Replace the whole client configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Client configuration.
    pub fn config(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Use the provided credential store for authentication challenges.
    pub fn with_credentials(mut self, credentials: impl CredentialStore) -> Self {
        self.credentials = Box::new(credentials);
        self
    }

    /// Set the upper bound on open connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the idle timeout of connections with requests outstanding.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the `User-Agent` header, or send none with `None`.
    pub fn user_agent(mut self, user_agent: Option<HeaderValue>) -> Self {
        self.config.user_agent = user_agent;
        self
    }

    /// Close idle connections which have not been used for `interval`, checking every
    /// `interval`.
    ///
    /// The reaper runs on the tokio runtime the client is built on, and stops once the
    /// client is dropped.
    pub fn reap_idle(mut self, interval: Duration) -> Self {
        self.reap_idle = Some(interval);
        self
    }
}

impl<T> Builder<T>
where
    T: Transport,
{
    /// Build the client.
    pub fn build(self) -> Client<T> {
        debug!(
            max_connections = self.config.max_connections,
            timeout = ?self.config.timeout,
            "building client"
        );
        let pool = Pool::new(self.config, self.credentials);

        if let Some(interval) = self.reap_idle {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(reap_idle(pool.downgrade(), interval));
                }
                Err(_) => warn!("no tokio runtime, idle connections will not be reaped"),
            }
        }

        Client::from_parts(self.transport, pool)
    }
}

async fn reap_idle<S>(pool: super::pool::WeakPool<S>, interval: Duration)
where
    S: super::conn::ByteStream,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            trace!("client dropped, idle reaper exiting");
            return;
        };
        pool.idle_cleanup(interval);
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::client::conn::transport::mock::MockTransport;

    assert_impl_all!(Builder: Send, fmt::Debug);

    #[test]
    fn settings_reach_the_client() {
        let client = Builder::new()
            .with_transport(MockTransport::new())
            .max_connections(7)
            .timeout(Some(Duration::from_secs(3)))
            .user_agent(None)
            .build();

        let config = client.config();
        assert_eq!(config.max_connections, 7);
        assert_eq!(config.timeout, Some(Duration::from_secs(3)));
        assert!(config.user_agent.is_none());
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test]
    async fn reaper_stops_with_the_client() {
        let _ = tracing_subscriber::fmt::try_init();
        let client = Builder::new()
            .with_transport(MockTransport::new())
            .reap_idle(Duration::from_millis(5))
            .build();
        let weak = client.pool.downgrade();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(weak.upgrade().is_some());

        drop(client);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(weak.upgrade().is_none());
    }
}
