use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::{crate_description, crate_version, Parser};
use kube_acme_operator::{
    acme::{
        propagation::{parse_nameserver, PropagationCheck},
        AcmeClient, AcmeConfig,
    },
    certificate_request_controller, crd, ingress_controller,
    store::KubeStore,
    APP_NAME, FIELD_MANAGER,
};
use stackable_operator::{cli::Command, logging::TracingTarget, namespace::WatchNamespace};
use url::Url;

const ENV_VAR_LOGGING: &str = "KUBE_ACME_OPERATOR_LOG";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<AcmeOperatorRun>,
}

#[derive(clap::Parser)]
struct AcmeOperatorRun {
    /// Namespace to watch, all namespaces are watched when empty
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    tracing_target: TracingTarget,

    /// ACME directory that certificates are ordered from
    #[arg(
        long,
        env,
        default_value = "https://acme-v02.api.letsencrypt.org/directory"
    )]
    acme_directory_url: Url,

    /// Recursive nameservers used to check that challenge records have propagated
    #[arg(
        long,
        env,
        value_delimiter = ',',
        default_value = "114.114.114.114:53",
        value_parser = parse_nameserver
    )]
    nameservers: Vec<SocketAddr>,

    /// Seconds to wait for challenge records to propagate
    #[arg(long, env, default_value_t = 120)]
    propagation_timeout_seconds: u64,

    /// Seconds between propagation checks
    #[arg(long, env, default_value_t = 2)]
    propagation_poll_interval_seconds: u64,

    /// Seconds to wait for the CA to validate an order and issue its certificate
    #[arg(long, env, default_value_t = 300)]
    order_timeout_seconds: u64,

    /// Seconds between order status checks
    #[arg(long, env, default_value_t = 2)]
    order_poll_interval_seconds: u64,

    /// Maximum number of CertificateRequests that are reconciled at the same time
    #[arg(long, env, default_value_t = 16)]
    concurrency: u16,

    /// Seconds before a failed reconciliation is retried
    #[arg(long, env, default_value_t = 10)]
    error_requeue_seconds: u64,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            print!("{}", crd::crds_yaml()?);
        }
        Command::Run(AcmeOperatorRun {
            watch_namespace,
            tracing_target,
            acme_directory_url,
            nameservers,
            propagation_timeout_seconds,
            propagation_poll_interval_seconds,
            order_timeout_seconds,
            order_poll_interval_seconds,
            concurrency,
            error_requeue_seconds,
        }) => {
            stackable_operator::logging::initialize_logging(
                ENV_VAR_LOGGING,
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let client =
                stackable_operator::client::create_client(Some(FIELD_MANAGER.to_string())).await?;
            let http = reqwest::Client::builder()
                .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
                .build()?;
            let store = KubeStore::new(client.as_kube_client());
            let acme_config = AcmeConfig {
                directory_url: acme_directory_url.to_string(),
                propagation: PropagationCheck {
                    nameservers,
                    timeout: Duration::from_secs(propagation_timeout_seconds),
                    poll_interval: Duration::from_secs(propagation_poll_interval_seconds),
                },
                order_timeout: Duration::from_secs(order_timeout_seconds),
                order_poll_interval: Duration::from_secs(order_poll_interval_seconds),
            };
            tracing::info!(
                directory_url = acme_config.directory_url,
                nameservers = ?acme_config.propagation.nameservers,
                "starting controllers"
            );
            let error_requeue = Duration::from_secs(error_requeue_seconds);

            let certificate_requests = certificate_request_controller::start(
                &client,
                &watch_namespace,
                Arc::new(certificate_request_controller::Ctx {
                    store: store.clone(),
                    authority: AcmeClient::new(acme_config, http),
                    error_requeue,
                }),
                concurrency,
            );
            let ingresses = ingress_controller::start(
                &client,
                &watch_namespace,
                Arc::new(ingress_controller::Ctx {
                    store,
                    error_requeue,
                }),
            );
            futures::join!(certificate_requests, ingresses);
        }
    }
    Ok(())
}
