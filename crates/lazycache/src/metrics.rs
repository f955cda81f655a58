//! Reporting of cache metrics to statsd.
//!
//! Metrics are dropped until [`configure`] installs a client. Every cache tags its metrics with
//! `cache` set to its configured name.
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{QueuingMetricSink, StatsdClient, UdpMetricSink};

use crate::config::Metrics;

static CLIENT: OnceLock<StatsdClient> = OnceLock::new();

/// Re-exports the cadence traits used by [`metric!`](crate::metric).
pub mod prelude {
    pub use cadence::prelude::*;
}

/// Starts sending metrics to the statsd server in `config`.
///
/// Does nothing if no server is configured. The client is global to the process, so only the
/// first successful call has an effect.
pub fn configure(config: &Metrics) -> Result<()> {
    let Some(ref server) = config.statsd else {
        return Ok(());
    };

    let addr = server
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve statsd server `{server}`"))?
        .next()
        .with_context(|| format!("statsd server `{server}` has no address"))?;

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(addr, socket).context("failed to create statsd sink")?;

    let mut builder = StatsdClient::builder(&config.prefix, QueuingMetricSink::from(sink))
        .with_error_handler(|error| tracing::debug!(%error, "Failed to send metric"));
    for (key, value) in &config.custom_tags {
        builder = builder.with_tag(key.as_str(), value.as_str());
    }

    if CLIENT.set(builder.build()).is_err() {
        tracing::warn!("Metrics were already configured");
    } else {
        tracing::info!(%addr, prefix = %config.prefix, "Reporting metrics to statsd");
    }
    Ok(())
}

/// Runs `f` with the statsd client, if one is configured.
#[doc(hidden)]
#[inline]
pub fn with_client(f: impl FnOnce(&StatsdClient)) {
    if let Some(client) = CLIENT.get() {
        f(client);
    }
}

/// Emits a counter, gauge or timer with optional tags.
///
/// ```ignore
/// metric!(counter("caches.access") += 1, "cache" => name);
/// metric!(gauge("caches.entries") = len as u64, "cache" => name);
/// metric!(timer("caches.load.duration") = elapsed, "cache" => name);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags($id, $value) $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags($id, $value) $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags($id, $value) $(, $k => $v)*)
    };
    (@send $method:ident($id:expr, $value:expr) $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.$method($id, $value)$(.with_tag($k, $v))*.send();
        })
    }};
}
