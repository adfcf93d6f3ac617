//! Config for the tokio runtime serving proxy traffic.
use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

/// Tokio runtime type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TokioRuntimeType {
    /// Current-thread runtime.
    CurrentThread,

    /// Multi-thread runtime.
    #[default]
    MultiThread,
}

/// CLI config for the tokio IO runtime.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct TokioIoConfig {
    /// Set the maximum number of IO runtime threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-io-threads", env = "INFLUXDB_PROXY_NUM_IO_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,

    /// IO tokio runtime type.
    #[clap(
        long = "io-runtime-type",
        env = "INFLUXDB_PROXY_IO_RUNTIME_TYPE",
        default_value_t = TokioRuntimeType::default(),
        value_enum,
        action
    )]
    pub runtime_type: TokioRuntimeType,

    /// Specifies the limit for additional threads spawned by the IO runtime.
    #[clap(
        long = "io-runtime-max-blocking-threads",
        env = "INFLUXDB_PROXY_IO_RUNTIME_MAX_BLOCKING_THREADS",
        action
    )]
    pub max_blocking_threads: Option<NonZeroUsize>,

    /// Sets a custom timeout for a thread in the blocking pool of the IO runtime.
    #[clap(
        long = "io-runtime-thread-keep-alive",
        env = "INFLUXDB_PROXY_IO_RUNTIME_THREAD_KEEP_ALIVE",
        value_parser = humantime::parse_duration
    )]
    pub thread_keep_alive: Option<Duration>,
}

impl TokioIoConfig {
    /// Creates the tokio runtime builder.
    pub fn builder(&self) -> Result<tokio::runtime::Builder, std::io::Error> {
        // NOTE: no log macros will work here, the subscriber is installed inside the runtime
        let mut builder = match self.runtime_type {
            TokioRuntimeType::CurrentThread => tokio::runtime::Builder::new_current_thread(),
            TokioRuntimeType::MultiThread => tokio::runtime::Builder::new_multi_thread(),
        };
        builder.enable_all();

        let thread_counter = Arc::new(AtomicUsize::new(1));
        builder.thread_name_fn(move || {
            format!(
                "InfluxDB Proxy Tokio IO {}",
                thread_counter.fetch_add(1, Ordering::SeqCst)
            )
        });

        let num_threads = match self.num_threads {
            None => std::thread::available_parallelism()?,
            Some(n) => n,
        };
        builder.worker_threads(num_threads.get());

        if let Some(x) = self.max_blocking_threads {
            builder.max_blocking_threads(x.get());
        }

        if let Some(x) = self.thread_keep_alive {
            builder.thread_keep_alive(x);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use clap::Parser;
    use futures::FutureExt;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_thread_name_and_io() {
        let mut builder = TokioIoConfig::parse_from(std::iter::empty::<OsString>())
            .builder()
            .unwrap();
        let rt = builder.build().unwrap();
        rt.block_on(async move {
            tokio::spawn(async move {
                let thread = std::thread::current();
                let name = thread.name().expect("thread is named");
                assert!(
                    name.starts_with("InfluxDB Proxy Tokio IO"),
                    "Invalid thread name: {name}"
                );

                // binding panics when IO is not enabled
                assert!(
                    TcpListener::bind("127.0.0.1:0")
                        .catch_unwind()
                        .await
                        .is_ok()
                );
            })
            .await
            .unwrap();
        });
    }

    #[test]
    fn test_current_thread() {
        let config = TokioIoConfig::parse_from(["proxy", "--io-runtime-type", "current-thread"]);
        assert_eq!(config.runtime_type, TokioRuntimeType::CurrentThread);
        let rt = config.builder().unwrap().build().unwrap();
        assert_eq!(rt.block_on(async { 1 + 1 }), 2);
    }
}
