use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_config::{imds, BehaviorVersion};
use aws_types::region::Region;
use aws_types::SdkConfig;
use std::time::Duration;

// Keep the credentials lookup from hanging if IMDS is unreachable.
const IMDS_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn sdk_imds_client() -> imds::Client {
    imds::Client::builder()
        .connect_timeout(IMDS_CONNECT_TIMEOUT)
        .build()
}

/// Builds the SDK configuration used for all EC2 API requests.
pub(crate) async fn sdk_config(region: &str) -> SdkConfig {
    let provider = DefaultCredentialsChain::builder()
        .imds_client(sdk_imds_client())
        .build()
        .await;
    aws_config::defaults(BehaviorVersion::v2023_11_09())
        .region(Region::new(region.to_owned()))
        .credentials_provider(provider)
        .load()
        .await
}
