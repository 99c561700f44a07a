/*!
# Introduction

eipdog associates a pre-designated Elastic IP address with the EC2 instance it runs on.
The address is named by an instance tag: the tag's value holds the public IP of an Elastic
IP allocation that already exists in the account.

This is intended for instances that need a stable public address across replacement, for
example members of an auto-scaling group sitting behind a DNS name that points at the
Elastic IP. At boot, the replacement instance runs eipdog, which:

1. asks IMDS for the instance's own ID, and for its region unless `--region` is given,
2. reads the named tag from the instance via `DescribeTags`,
3. resolves the tag's value to an allocation via `DescribeAddresses` and binds that
   allocation to the instance with `AssociateAddress`.

The association call re-binds the address if it is currently attached to another instance,
subject to the account's reassociation semantics; two instances racing for the same address
get whichever association EC2 processes last. Any failure is fatal, and the only mutation
is the final association call, so there is nothing to roll back.
*/

mod aws;
mod ec2;

use argh::FromArgs;
use imdsclient::ImdsClient;
use log::info;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::{ensure, OptionExt, ResultExt};
use std::process;

/// Associates the Elastic IP address named by an instance tag with this instance.
#[derive(FromArgs, Debug)]
struct Args {
    /// name of the instance tag whose value holds the Elastic IP address
    #[argh(option)]
    tag_name: String,

    /// filter level for log messages
    #[argh(option, default = "LevelFilter::Info")]
    log_level: LevelFilter,

    /// AWS region to use instead of the region reported by IMDS
    #[argh(option)]
    region: Option<String>,
}

mod error {
    use crate::ec2;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(super) enum Error {
        #[snafu(context(false), display("{}", source))]
        Ec2 { source: ec2::Error },

        #[snafu(display("--tag-name must not be empty"))]
        EmptyTagName,

        #[snafu(display("IMDS request failed: {}", source))]
        ImdsRequest { source: imdsclient::Error },

        #[snafu(display("IMDS request failed: No '{}' found", what))]
        ImdsNone { what: String },

        #[snafu(display("Failed to initialize logger: {}", source))]
        Logger { source: log::SetLoggerError },
    }
}

use error::Error;

type Result<T> = std::result::Result<T, Error>;

/// Returns the instance ID of the instance we are running on.
async fn get_instance_id(client: &mut ImdsClient) -> Result<String> {
    client
        .fetch_instance_id()
        .await
        .context(error::ImdsRequestSnafu)?
        .context(error::ImdsNoneSnafu {
            what: "instance-id",
        })
}

/// Returns the region of the instance we are running on.
async fn get_region(client: &mut ImdsClient) -> Result<String> {
    client
        .fetch_region()
        .await
        .context(error::ImdsRequestSnafu)?
        .context(error::ImdsNoneSnafu { what: "region" })
}

async fn run() -> Result<()> {
    let args: Args = argh::from_env();

    // TerminalMode::Stderr keeps stdout clean for callers that check it.
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    ensure!(!args.tag_name.is_empty(), error::EmptyTagNameSnafu);

    let mut imds = ImdsClient::new();
    let instance_id = get_instance_id(&mut imds).await?;
    let region = match args.region {
        Some(region) => region,
        None => get_region(&mut imds).await?,
    };
    info!("Instance {} in region {}", instance_id, region);

    let config = aws::sdk_config(&region).await;
    let client = aws_sdk_ec2::Client::new(&config);

    let public_ip = ec2::fetch_tag_value(&client, &instance_id, &args.tag_name).await?;
    info!("Tag '{}' holds Elastic IP {}", args.tag_name, public_ip);

    let allocation_id = ec2::find_allocation_id(&client, &public_ip).await?;
    let association_id = ec2::associate_address(&client, &allocation_id, &instance_id).await?;
    info!(
        "Associated {} ({}) with {}{}",
        public_ip,
        allocation_id,
        instance_id,
        association_id
            .map(|id| format!(" as {}", id))
            .unwrap_or_default()
    );
    Ok(())
}

// Returning a Result from main makes it print a Debug representation of the error, but with Snafu
// we have nice Display representations of the error, so we wrap "main" (run) and print any error.
// https://github.com/shepmaster/snafu/issues/110
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
