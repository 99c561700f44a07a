use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::associate_address::AssociateAddressError;
use aws_sdk_ec2::operation::describe_addresses::DescribeAddressesError;
use aws_sdk_ec2::operation::describe_tags::DescribeTagsError;
use aws_sdk_ec2::types::{Address, Filter, TagDescription};
use aws_sdk_ec2::Client as Ec2Client;
use aws_smithy_types::error::display::DisplayErrorContext;
use log::warn;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub(super) enum Error {
    #[snafu(display("No address found for public IP '{}'", public_ip))]
    AddressNotFound { public_ip: String },

    #[snafu(display(
        "Error associating address '{}' with instance '{}': {}",
        allocation_id,
        instance_id,
        DisplayErrorContext(source)
    ))]
    AssociateAddress {
        allocation_id: String,
        instance_id: String,
        source: SdkError<AssociateAddressError>,
    },

    #[snafu(display(
        "Error describing address '{}': {}",
        public_ip,
        DisplayErrorContext(source)
    ))]
    DescribeAddresses {
        public_ip: String,
        source: SdkError<DescribeAddressesError>,
    },

    #[snafu(display(
        "Error describing tags for instance '{}': {}",
        instance_id,
        DisplayErrorContext(source)
    ))]
    DescribeTags {
        instance_id: String,
        source: SdkError<DescribeTagsError>,
    },

    #[snafu(display("Missing field '{}' in EC2 response", field))]
    Missing { field: &'static str },

    #[snafu(display("No '{}' tag found on instance '{}'", tag_name, instance_id))]
    TagNotFound {
        tag_name: String,
        instance_id: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Returns the value of the first tag on `instance_id` whose key is exactly `tag_name`.
pub(super) async fn fetch_tag_value(
    client: &Ec2Client,
    instance_id: &str,
    tag_name: &str,
) -> Result<String> {
    let tags = client
        .describe_tags()
        .filters(
            Filter::builder()
                .name("resource-id")
                .values(instance_id)
                .build(),
        )
        .send()
        .await
        .context(DescribeTagsSnafu { instance_id })?
        .tags
        .unwrap_or_default();

    tag_value(&tags, tag_name).context(TagNotFoundSnafu {
        tag_name,
        instance_id,
    })
}

/// Scans `tags` in the order the provider returned them for an exact, case-sensitive key match.
fn tag_value(tags: &[TagDescription], tag_name: &str) -> Option<String> {
    tags.iter()
        .find(|tag| tag.key() == Some(tag_name))
        .and_then(|tag| tag.value())
        .map(|value| value.to_string())
}

/// Resolves a public IP to its allocation ID via the account's address inventory.
pub(super) async fn find_allocation_id(client: &Ec2Client, public_ip: &str) -> Result<String> {
    let addresses = client
        .describe_addresses()
        .filters(Filter::builder().name("public-ip").values(public_ip).build())
        .send()
        .await
        .context(DescribeAddressesSnafu { public_ip })?
        .addresses
        .unwrap_or_default();

    let address = first_address(&addresses).context(AddressNotFoundSnafu { public_ip })?;
    address
        .allocation_id()
        .map(|allocation_id| allocation_id.to_string())
        .context(MissingSnafu {
            field: "Addresses.AllocationId",
        })
}

/// Picks the address record to use. The public-ip filter can only match one address under
/// normal EC2 semantics; if more come back we keep the provider's first.
fn first_address(addresses: &[Address]) -> Option<&Address> {
    if addresses.len() > 1 {
        warn!(
            "Found {} address records, using the first",
            addresses.len()
        );
    }
    addresses.first()
}

/// Binds the allocation to the instance, returning the association ID.
pub(super) async fn associate_address(
    client: &Ec2Client,
    allocation_id: &str,
    instance_id: &str,
) -> Result<Option<String>> {
    let response = client
        .associate_address()
        .allocation_id(allocation_id)
        .instance_id(instance_id)
        .send()
        .await
        .context(AssociateAddressSnafu {
            allocation_id,
            instance_id,
        })?;
    Ok(response.association_id)
}
