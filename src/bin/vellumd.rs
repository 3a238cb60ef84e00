// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of vellum.
//
// vellum is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// vellum is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with vellum.  If not,
// see <http://www.gnu.org/licenses/>.

//! # vellumd
//!
//! The vellum server: reads a versioned TOML configuration file, connects ScyllaDB & Redis,
//! spins up background task processing & serves the HTTP API until told to stop. SIGHUP closes
//! the database connections, re-reads configuration & rebuilds the world; SIGTERM shuts down
//! gracefully. vellumd always runs in the foreground (it's expected to live under a supervisor
//! or in a container) & logs to stdout, structured by default.

use std::{
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::{extract::State, http::HeaderValue, routing::get, Router};
use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use opentelemetry::{global, KeyValue};
use secrecy::SecretString;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use vellum::{
    background::{self, Context},
    blog_cache::{BlogCache, CacheTtls},
    blogs::make_router as make_blog_router,
    cache::Backend as CacheBackend,
    interactions::make_router as make_interaction_router,
    metrics::{check_metric_registrations, Instruments},
    reactions::ReactionToggle,
    storage::Backend as StorageBackend,
    vellum::Vellum,
    views::{FraudPolicy, ViewTracker},
    window::Windows,
};

/// The vellum application error type
///
/// I'm opting to build this using [Snafu]: at the application level I want a fairly rich set of
/// errors in the hopes of helping operators, and that means a lot of boilerplate for the
/// hand-authored route.
///
/// [Snafu]: https://docs.rs/snafu/latest/snafu/index.html
///
/// Note that I do not derive the [Debug] trait for this error. `main()` returns
/// `Result<(), Error>`, and on the `Err` variant the Rust runtime uses the `Debug`
/// implementation to produce an error message on stderr; the derived implementation is not very
/// readable (and, in the presence of a backtrace, verbose as well), so I implement it by hand in
/// terms of [Display].
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read configuration file: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("While building the Prometheus exporter, {source}"))]
    Exporter {
        source: opentelemetry_sdk::metrics::MetricError,
    },
    #[snafu(display("Failed to connect to Redis: {source}"))]
    Redis { source: vellum::redis::Error },
    #[snafu(display("Failed to connect to ScyllaDB: {source}"))]
    Scylla {
        #[snafu(source(from(vellum::scylla::Error, Box::new)))]
        source: Box<vellum::scylla::Error>,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

/// ScyllaDB credentials; username & password.
// Nb. we can only deserialize (i.e. not serialize) due to the presence of secrets in the struct.
#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub username: SecretString,
    pub password: SecretString,
}

/// vellum datastore configuration
#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    /// ScyllaDB credentials, if authentication is to be used
    pub credentials: Option<Credentials>,
    /// ScyllaDB hosts; specify as "host:port"
    pub hosts: Vec<SocketAddr>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            credentials: None,
            hosts: vec!["127.0.0.1:9042".parse::<SocketAddr>().unwrap(/* known good */)],
        }
    }
}

/// vellum configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
struct ConfigV1 {
    /// Local address at which to listen; specify as "address:port".
    #[serde(rename = "public-address")]
    public_address: SocketAddr,
    #[serde(rename = "storage-config")]
    storage_config: StorageConfig,
    /// Redis connection URL for the volatile cache tier
    #[serde(rename = "redis-url")]
    redis_url: String,
    #[serde(rename = "cache-ttls")]
    cache_ttls: CacheTtls,
    #[serde(rename = "fraud-policy")]
    fraud_policy: FraudPolicy,
    #[serde(rename = "background-tasks")]
    background_tasks: background::Config,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: "0.0.0.0:8044".parse::<SocketAddr>().unwrap(/* known good */),
            storage_config: StorageConfig::default(),
            redis_url: "redis://127.0.0.1:6379".to_owned(),
            cache_ttls: CacheTtls::default(),
            fraud_policy: FraudPolicy::default(),
            background_tasks: background::Config::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the vellum configuration file
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from_str("/etc/vellum.toml").unwrap(), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

/// Configure vellum logging: stdout, structured by default, human-readable with `--plain`.
///
/// This method can only be invoked once (as it, in turn, calls tracing's
/// [set_global_default](tracing::subscriber::set_global_default)).
fn configure_logging(logopts: &LogOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers *of different types*; it is for this reason that
    // `Box<dyn Layer<S> + Send + Sync>` implements `Layer`:
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if logopts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        )
    };

    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           telemetry                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// Must be invoked before any instruments are built. Returns the Prometheus registry backing the
/// `/metrics` endpoint.
fn init_telemetry() -> Result<prometheus::Registry> {
    check_metric_registrations();
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .context(ExporterSnafu)?;

    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(opentelemetry_sdk::Resource::new([KeyValue::new(
            "service.name",
            "vellum",
        )]))
        .with_reader(exporter)
        .build();
    global::set_meter_provider(provider);

    Ok(registry)
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<Vellum>>) -> String {
    prometheus::TextEncoder::new()
        .encode_to_string(&state.registry.gather())
        .expect("Failed to encode Prom metrics")
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Counter for generating request IDs; a u64 carries less information than the traditional UUID,
/// but it's enough, more easily readable & a useful gauge of how long the server's been up.
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| RequestId::new(HeaderValue::from_str(&s).unwrap(/* known good */)))
            .pipe(Some)
    }
}

/// Make the [Router] that will be accessible to the world
fn make_world_router(state: Arc<Vellum>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .merge(make_blog_router(state.clone()))
        .merge(make_interaction_router(state.clone()))
        // Incoming requests must hit the `SetRequestIdLayer` *first*, so it's the last/outer
        // layer we apply.
        .layer(PropagateRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            RequestIdGenerator::default(),
        ))
        .with_state(state)
}

/// Serve `vellum` API requests
#[tracing::instrument(skip(opts, cfg))]
async fn serve(opts: CliOpts, mut cfg: ConfigV1) -> Result<()> {
    // Produce a future which can be used to signal graceful shutdown, below.
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    let mut sighup = signal(SignalKind::hangup()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();

    let registry = init_telemetry()?;

    // Loop forever, handling SIGHUPs, until asked to terminate:
    loop {
        // Re-build our database connections each pass, in case configuration values have changed:
        let storage: Arc<dyn StorageBackend + Send + Sync> = Arc::new(
            vellum::scylla::Session::new(
                cfg.storage_config.hosts.iter().map(|h| h.to_string()),
                &cfg.storage_config
                    .credentials
                    .as_ref()
                    .map(|c| (c.username.clone(), c.password.clone())),
            )
            .await
            .context(ScyllaSnafu)?,
        );
        let cache: Arc<dyn CacheBackend + Send + Sync> = Arc::new(
            vellum::redis::Cache::new(&cfg.redis_url)
                .await
                .context(RedisSnafu)?,
        );

        let instruments = Arc::new(Instruments::new("vellum"));

        // Background task processing: the send side goes to the reaction toggle, the processor
        // is ours to wind down.
        let (task_queue, task_processor) = background::new(
            Context {
                storage: storage.clone(),
            },
            Some(cfg.background_tasks.clone()),
            instruments.clone(),
        );

        let state = Arc::new(Vellum {
            blog_cache: BlogCache::new(cache.clone(), cfg.cache_ttls, instruments.clone()),
            views: ViewTracker::new(
                storage.clone(),
                Windows::new(cache.clone(), storage.clone()),
                cfg.fraud_policy,
            ),
            reactions: ReactionToggle::new(storage.clone(), Some(task_queue)),
            storage,
            registry: registry.clone(),
            instruments,
        });

        let world_nfy = Arc::new(Notify::new());

        let world_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_world_router(state.clone())
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(world_nfy.clone()));

        info!("vellum listening on {}", cfg.public_address);

        let (mut processor_join_handle, processor_shutdown) = task_processor.into_parts();
        let mut world_server = world_server.into_future();

        fn log_on_err<T, E>(x: StdResult<T, E>)
        where
            E: std::fmt::Debug,
        {
            if let Err(err) = x {
                error!("{:?}", err);
            }
        }

        tokio::select! {
            // Intentionally not handling this-- the server *should* never shut down on its own.
            // That said, if I don't move `world_server` into a Future, it never gets polled.
            _ = &mut world_server => unimplemented!(),
            _ = sighup.recv() => {
                info!("Received SIGHUP; closing DB connections to re-read configuration.");
                world_nfy.notify_one();
                log_on_err(world_server.await);
                processor_shutdown.notify_one();
                log_on_err(tokio::time::timeout(std::time::Duration::from_secs(5), processor_join_handle).await);
                cfg = match parse_config(&opts.cfg) {
                    Ok(cfg) => cfg,
                    Err(_) => cfg
                };
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                world_nfy.notify_one();
                log_on_err(world_server.await);
                // and shut down our background processor:
                processor_shutdown.notify_one();
                // There's not much to be done on failure here, but if there is a problem, I'd
                // like to at least know:
                match tokio::time::timeout(std::time::Duration::from_secs(5), processor_join_handle)
                    .await {
                        Ok(Err(err)) => error!("Failed to shut down the task processor: {:?}", err),
                        Err(err) => error!("Failed waiting to shut down the task processor: {:?}", err),
                        _ => ()
                    };
                break;
            }
            res = &mut processor_join_handle => {
                // This shouldn't happen!
                error!("The background task processor exited early with {:?}; shutting down.", res);
                world_nfy.notify_one();
                log_on_err(world_server.await);
                break;
            },
        }; // End tokio::select!.
    } // End loop.

    Ok(())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn main() -> Result<()> {
    // Most of vellumd's configuration is read from file; the command-line options govern where
    // to find that file & how to log. They all have corresponding environment variables for the
    // sake of convenience when running vellum in a container.
    let opts = CliOpts::new(
        Command::new("vellumd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("A blogging backend")
            .long_about(
                "`vellum` is a blogging backend with fraud-aware view counting, reaction \
                 tracking & a cache-aside read layer.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("VELLUM_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                       configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("VELLUM_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("VELLUM_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("VELLUM_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("VELLUM_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    configure_logging(&opts.log_opts)?;
    let cfg = parse_config(&opts.cfg)?;

    info!("vellum version {} starting.", crate_version!());

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(serve(opts, cfg))
}
