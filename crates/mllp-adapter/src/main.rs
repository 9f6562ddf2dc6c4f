//! The mllp-adapter binary bridges a legacy HL7v2 endpoint speaking MLLP
//! over TCP and a cloud HL7v2 store reached over HTTPS.
//!
//! Inbound, it accepts MLLP-framed messages, ingests them into the store
//! and relays the store's ACK or NACK on the same connection. Outbound,
//! it consumes Pub/Sub notifications of newly created store messages,
//! fetches each message and forwards it to the configured MLLP target,
//! acknowledging the notification only after the target replied.
//!
//! ## Usage
//!
//! ```bash
//! mllp-adapter \
//!   --receiver-ip 0.0.0.0 \
//!   --hl7-v2-project-id my-project \
//!   --hl7-v2-location-id us-central1 \
//!   --hl7-v2-dataset-id my-dataset \
//!   --hl7-v2-store-id my-store \
//!   --mllp-addr 10.0.0.5:2575 \
//!   --pubsub-project-id my-project \
//!   --pubsub-subscription hl7-notifications
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use tokio::task::JoinSet;

use mllp_common::TokenProvider;
use mllp_metrics::MetricsRegistry;
use mllp_notify::{subscribe, NotificationHandler, PubsubConfig};
use mllp_receiver::MllpReceiver;
use mllp_sender::MllpSender;
use mllp_store::{
    FileTokenProvider, Hl7v2Client, Hl7v2Config, MetadataTokenProvider, DEFAULT_API_PREFIX,
};

/// Adapter between MLLP endpoints on the local network and the cloud
/// HL7v2 store.
#[derive(FromArgs)]
struct Args {
    /// port on which to listen for incoming MLLP connections
    /// (2575 is the IANA-assigned port for HL7 over TCP)
    #[argh(option, default = "2575")]
    port: u16,

    /// IP address on which to listen for incoming MLLP connections
    #[argh(option)]
    receiver_ip: String,

    /// target address for outgoing MLLP connections
    #[argh(option)]
    mllp_addr: Option<String>,

    /// project ID that owns the Pub/Sub subscription
    #[argh(option)]
    pubsub_project_id: Option<String>,

    /// pub/Sub subscription to read for notifications of new messages
    #[argh(option)]
    pubsub_subscription: Option<String>,

    /// project ID that owns the healthcare dataset
    #[argh(option)]
    hl7_v2_project_id: String,

    /// ID of the Cloud location where the healthcare dataset is stored
    #[argh(option)]
    hl7_v2_location_id: String,

    /// ID of the healthcare dataset
    #[argh(option)]
    hl7_v2_dataset_id: String,

    /// ID of the HL7v2 store inside the healthcare dataset
    #[argh(option)]
    hl7_v2_store_id: String,

    /// prefix of the HL7v2 store API including scheme and version;
    /// defaults to the production Cloud Healthcare API
    #[argh(option)]
    api_addr_prefix: Option<String>,

    /// path to a file holding an OAuth2 access token; the default
    /// service account of the environment is used if not provided
    #[argh(option)]
    credentials: Option<String>,

    /// whether to log the contents of messages that receive a NACK from
    /// the store; these logs contain sensitive data
    #[argh(switch)]
    log_nacked_msg: bool,

    /// whether to export metrics (skipped automatically when not running
    /// in a supported environment)
    #[argh(option, default = "true")]
    export_stats: bool,

    /// port of the exported metrics endpoint
    #[argh(option, default = "9090")]
    metrics_port: u16,

    /// whether to require the legacy publish=true attribute on
    /// notifications; this attribute appears only in notifications from
    /// explicit create calls
    #[argh(switch)]
    legacy_publish_attribute: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let metrics = Arc::new(MetricsRegistry::new());
    if args.export_stats {
        // Off-GCE the probe fails and export is skipped; only a real
        // startup failure (e.g. the port is taken) aborts.
        mllp_metrics::start_export(metrics.clone(), args.metrics_port)
            .await
            .context("failed to configure metrics export")?;
    }

    let tokens: Arc<dyn TokenProvider> = match &args.credentials {
        Some(path) => Arc::new(FileTokenProvider::new(path)),
        None => Arc::new(MetadataTokenProvider::new()?),
    };

    let store = Arc::new(
        Hl7v2Client::new(
            Hl7v2Config {
                api_prefix: args
                    .api_addr_prefix
                    .clone()
                    .unwrap_or_else(|| DEFAULT_API_PREFIX.to_string()),
                project_id: args.hl7_v2_project_id.clone(),
                location_id: args.hl7_v2_location_id.clone(),
                dataset_id: args.hl7_v2_dataset_id.clone(),
                store_id: args.hl7_v2_store_id.clone(),
                log_nacked: args.log_nacked_msg,
            },
            tokens.clone(),
            metrics.clone(),
        )
        .context("failed to create HL7v2 store client")?,
    );

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    match (&args.pubsub_project_id, &args.pubsub_subscription) {
        (Some(project), Some(subscription)) => {
            let mllp_addr = args.mllp_addr.clone().ok_or_else(|| {
                anyhow!("--mllp-addr is required when a Pub/Sub subscription is configured")
            })?;
            let sender = Arc::new(MllpSender::new(mllp_addr, metrics.clone()));
            let handler = Arc::new(NotificationHandler::new(
                metrics.clone(),
                store.clone(),
                sender,
                args.legacy_publish_attribute,
            ));
            let config = PubsubConfig::new(project.clone(), subscription.clone());
            let tokens = tokens.clone();
            tasks.spawn(async move {
                subscribe(config, tokens, handler)
                    .await
                    .context("notification subscription terminated")?;
                Ok(())
            });
        }
        _ => {
            tracing::info!(
                "either --pubsub-project-id or --pubsub-subscription is not provided; \
                 notifications are not read and no outgoing messages will be sent"
            );
        }
    }

    let ip: IpAddr = args
        .receiver_ip
        .parse()
        .with_context(|| format!("invalid --receiver-ip {}", args.receiver_ip))?;
    let receiver = MllpReceiver::bind(ip, args.port, store, metrics)
        .await
        .context("failed to create MLLP receiver")?;
    tracing::info!(
        "listening for MLLP connections on {}",
        receiver.local_addr()?
    );
    tasks.spawn(async move {
        receiver.run().await.context("MLLP receiver terminated")?;
        Ok(())
    });

    // Both loops run until the process is killed; any of them returning
    // is fatal.
    match tasks.join_next().await {
        Some(Ok(Err(err))) => Err(err),
        Some(Ok(Ok(()))) => Err(anyhow!("adapter task exited unexpectedly")),
        Some(Err(err)) => Err(anyhow!("adapter task panicked: {}", err)),
        None => Err(anyhow!("no adapter task was started")),
    }
}
