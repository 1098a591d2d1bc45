use std::sync::Arc;

use clap::Parser;
use fanout_operator::{
    OPERATOR_NAME,
    cli::{Command, Opts, RunArguments},
    client::Client,
    controller::{Ctx, fanout_job, fanout_schedule, list_source},
    crd,
    logging::initialize_logging,
    secret::KubeSecretResolver,
    source::{self, SourceResolver},
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to render CRDs"))]
    RenderCrds { source: crd::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to set up source adaptors"))]
    CreateSourceResolver { source: source::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    match opts.command {
        Command::Crd => {
            print!("{}", crd::crds_yaml().context(RenderCrdsSnafu)?);
            Ok(())
        }
        Command::Run(run) => run_operator(run).await,
    }
}

async fn run_operator(run: RunArguments) -> Result<(), Error> {
    initialize_logging("FANOUT_OPERATOR_LOG", OPERATOR_NAME);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        watch_namespace = ?run.watch_namespace,
        "starting {OPERATOR_NAME}"
    );

    let kube_client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let client = Client::new(kube_client, run.field_manager);
    let resolver = SourceResolver::new(run.http_timeout.into(), run.sql_connect_timeout.into())
        .context(CreateSourceResolverSnafu)?;
    let ctx = Arc::new(Ctx::new(
        client.clone(),
        resolver,
        Arc::new(KubeSecretResolver::new(client)),
        run.shim_image,
        run.error_requeue.into(),
    ));

    futures::future::join3(
        list_source::run(ctx.clone(), &run.watch_namespace),
        fanout_job::run(ctx.clone(), &run.watch_namespace),
        fanout_schedule::run(ctx, &run.watch_namespace),
    )
    .await;
    tracing::info!("all controllers stopped");
    Ok(())
}
