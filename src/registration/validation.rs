//! # Naming & Validation
//!
//! Stateless rules every descriptor passes through before it reaches a backend, plus
//! the canonical generators for ids, tags and metadata.
//!
//! - Service names match `^[a-z0-9][a-z0-9-]*$` and end in `-service`; the gateway
//!   name [`GATEWAY_SERVICE_NAME`] is exempt from the suffix rule.
//! - Ids are `{name}-{instance-token}`, at least two non-empty hyphen-separated parts.
//! - Tags carry `service_type:<T>` and `version:<v>`.
//! - Metadata carries `version`, `type` and `environment` with bounded values.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::core::error::ValidationError;
use crate::core::types::{Environment, ServiceDescriptor, ServiceType};

/// Reserved name of the gateway, the only name without the `-service` suffix
pub const GATEWAY_SERVICE_NAME: &str = "api-gateway";

pub const SERVICE_NAME_SUFFIX: &str = "-service";
pub const TAG_SERVICE_TYPE: &str = "service_type";
pub const TAG_VERSION: &str = "version";
pub const META_VERSION: &str = "version";
pub const META_TYPE: &str = "type";
pub const META_ENVIRONMENT: &str = "environment";

/// Platform marker tags appended to every default tag set
const PLATFORM_TAGS: [&str; 2] = ["jobfirst", "future"];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static name pattern"))
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^v[0-9]+\.[0-9]+\.[0-9]+$").expect("static version pattern"))
}

/// Validate a canonical service name
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if !name_pattern().is_match(name) {
        return Err(invalid(
            "only lowercase letters, digits and '-' are allowed, starting with a letter or digit",
        ));
    }
    if name != GATEWAY_SERVICE_NAME && !name.ends_with(SERVICE_NAME_SUFFIX) {
        return Err(invalid("name must end with '-service'"));
    }
    Ok(())
}

/// Validate a service id of the form `{name}-{instance-token}`
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("id is empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(invalid("id contains whitespace"));
    }

    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() < 2 {
        return Err(invalid("expected {service-name}-{instance-id}"));
    }
    if parts.iter().any(|part| part.is_empty()) {
        return Err(invalid("hyphen-separated parts must be non-empty"));
    }
    Ok(())
}

/// Validate a `vMAJOR.MINOR.PATCH` version string
pub fn validate_version(version: &str) -> Result<(), ValidationError> {
    if version_pattern().is_match(version) {
        Ok(())
    } else {
        Err(ValidationError::InvalidVersion {
            version: version.to_string(),
        })
    }
}

/// Require the `service_type:` and `version:` tags
pub fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
    for prefix in [TAG_SERVICE_TYPE, TAG_VERSION] {
        let needle = format!("{}:", prefix);
        if !tags.iter().any(|tag| tag.starts_with(&needle)) {
            return Err(ValidationError::MissingTag {
                prefix: prefix.to_string(),
            });
        }
    }
    Ok(())
}

/// Require `version`, `type` and `environment` with their accepted values
pub fn validate_metadata(metadata: &HashMap<String, String>) -> Result<(), ValidationError> {
    for key in [META_VERSION, META_TYPE, META_ENVIRONMENT] {
        if !metadata.contains_key(key) {
            return Err(ValidationError::MissingMetadata {
                key: key.to_string(),
            });
        }
    }

    if let Some(version) = metadata.get(META_VERSION) {
        validate_version(version)?;
    }

    if let Some(value) = metadata.get(META_TYPE) {
        if value.parse::<ServiceType>().is_err() {
            return Err(ValidationError::InvalidServiceType {
                value: value.clone(),
                accepted: join(ServiceType::ALL.iter().map(ServiceType::as_str)),
            });
        }
    }

    if let Some(value) = metadata.get(META_ENVIRONMENT) {
        if value.parse::<Environment>().is_err() {
            return Err(ValidationError::InvalidEnvironment {
                value: value.clone(),
                accepted: join(Environment::ALL.iter().map(Environment::as_str)),
            });
        }
    }

    Ok(())
}

/// Run every rule against a descriptor
pub fn validate_descriptor(descriptor: &ServiceDescriptor) -> Result<(), ValidationError> {
    validate_name(&descriptor.name)?;
    validate_id(&descriptor.id)?;

    if descriptor.port == 0 {
        return Err(ValidationError::InvalidPort {
            port: u32::from(descriptor.port),
        });
    }
    if descriptor.address.is_empty() || descriptor.address.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidAddress {
            address: descriptor.address.clone(),
        });
    }
    if !descriptor.health_path.starts_with('/') {
        return Err(ValidationError::InvalidHealthPath {
            path: descriptor.health_path.clone(),
        });
    }

    validate_tags(&descriptor.tags)?;
    validate_metadata(&descriptor.metadata)
}

/// `name + "-" + instance_token`
pub fn generate_id(name: &str, instance_token: &str) -> String {
    format!("{}-{}", name, instance_token)
}

/// `hostname + "-" + port`
pub fn generate_instance_token(hostname: &str, port: u16) -> String {
    format!("{}-{}", hostname, port)
}

pub fn default_tags(service_type: ServiceType, version: &str) -> Vec<String> {
    let mut tags = vec![
        format!("{}:{}", TAG_SERVICE_TYPE, service_type),
        format!("{}:{}", TAG_VERSION, version),
    ];
    tags.extend(PLATFORM_TAGS.iter().map(|tag| tag.to_string()));
    tags
}

pub fn default_metadata(
    service_type: ServiceType,
    version: &str,
    environment: Environment,
) -> HashMap<String, String> {
    HashMap::from([
        (META_VERSION.to_string(), version.to_string()),
        (META_TYPE.to_string(), service_type.to_string()),
        (META_ENVIRONMENT.to_string(), environment.to_string()),
        ("mode".to_string(), "future".to_string()),
        ("framework".to_string(), "axum".to_string()),
        ("language".to_string(), "rust".to_string()),
    ])
}

fn join<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values.collect::<Vec<_>>().join(", ")
}
