pub mod config;
pub mod telemetry;

use aws_config::SdkConfig;
use config::{Config, TenantConfigSource};
use delivery::aws::{
    AwsClientFactory, DynamoConfigStore, S3Client, SqsQueue, StsRoleAssumer, load_sdk_config,
};
use delivery::credentials::{CredentialBroker, RoleAssumer};
use delivery::notification::Notification;
use delivery::tenant::{FileConfigStore, FileStoreError, TenantConfigStore, TenantResolver};
use delivery::worker::Worker;
use delivery::{ApiError, DeliveryError, DispatchReport, Dispatcher};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("aws.queue_url is required to run the worker")]
    MissingQueueUrl,
    #[error("could not determine caller account: {0}")]
    CallerIdentity(ApiError),
    #[error("could not load tenant configs: {0}")]
    TenantConfigs(#[from] FileStoreError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("admin listener failed: {0}")]
    Admin(#[from] std::io::Error),
}

async fn build_dispatcher(config: &Config, sdk_config: &SdkConfig) -> Result<Dispatcher, RunError> {
    let sts = Arc::new(StsRoleAssumer::new(sdk_config));
    let caller_account_id = match &config.aws.caller_account_id {
        Some(account) => account.clone(),
        None => sts
            .caller_account_id()
            .await
            .map_err(RunError::CallerIdentity)?,
    };
    tracing::info!(caller_account_id = %caller_account_id, "Resolved caller account");

    let broker = CredentialBroker::new(
        sts,
        config.aws.central_role_arn.clone(),
        caller_account_id,
    )?;

    let store: Arc<dyn TenantConfigStore> = match &config.aws.tenant_configs {
        TenantConfigSource::Dynamodb { table } => {
            Arc::new(DynamoConfigStore::new(sdk_config, table.clone()))
        }
        TenantConfigSource::File { path } => Arc::new(FileConfigStore::from_file(path)?),
    };

    Ok(Dispatcher::new(
        TenantResolver::new(store),
        broker,
        Arc::new(S3Client::new(sdk_config)),
        Arc::new(AwsClientFactory::new(sdk_config)),
        &config.delivery,
    ))
}

/// Consumes staged-file notifications until `token` is cancelled, serving the
/// admin endpoints alongside.
pub async fn run_worker(config: Config, token: CancellationToken) -> Result<(), RunError> {
    let queue_url = config
        .aws
        .queue_url
        .clone()
        .ok_or(RunError::MissingQueueUrl)?;

    let sdk_config = load_sdk_config(config.aws.region.clone()).await;
    let dispatcher = Arc::new(build_dispatcher(&config, &sdk_config).await?);
    let queue = Arc::new(SqsQueue::new(&sdk_config, queue_url, &config.worker));
    let worker = Worker::new(queue, dispatcher, config.worker.clone());

    let ready = worker.readiness();
    let admin = AdminService::new(move || ready.load(Ordering::Relaxed));
    let admin_token = token.clone();
    let listener = config.admin_listener.clone();
    let admin_task = tokio::spawn(async move {
        run_http_service(&listener.host, listener.port, admin, admin_token).await
    });

    worker.run(token.clone()).await;

    // The worker only returns once cancelled, which also stops the listener.
    token.cancel();
    match admin_task.await {
        Ok(result) => result?,
        Err(error) => tracing::error!(error = %error, "Admin listener panicked"),
    }
    Ok(())
}

/// Delivers one staged object outside of the queue. Requeue decisions are
/// reported but not acted on.
pub async fn deliver_object(
    config: Config,
    bucket: &str,
    key: &str,
    token: CancellationToken,
) -> Result<DispatchReport, RunError> {
    let sdk_config = load_sdk_config(config.aws.region.clone()).await;
    let dispatcher = build_dispatcher(&config, &sdk_config).await?;
    let notification = Notification::for_object(bucket, key);
    Ok(dispatcher.dispatch(&notification, "", &token).await)
}

/// Cancels `token` on ctrl-c or, on unix, SIGTERM.
pub fn spawn_signal_handlers(token: &CancellationToken) {
    let signal_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
                signal_token.cancel();
            }
            Err(error) => {
                tracing::error!(error = %error, "Error setting up signal handler");
            }
        }
    });

    #[cfg(unix)]
    {
        let sigterm_token = token.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM signal");
                    sigterm_token.cancel();
                }
                Err(error) => {
                    tracing::error!(error = %error, "Error setting up SIGTERM handler");
                }
            }
        });
    }
}
