//! # Registrar Helpers
//!
//! Builders that synthesize a canonical [`ServiceDescriptor`] for each platform role.
//! Ports come from `<NAME_WITH_UNDERSCORES>_PORT` variables (for example
//! `API_GATEWAY_PORT`, `USER_SERVICE_PORT`); environment, version, hostname and
//! address come from the process-wide [`ServiceConfig`]. Every builder validates the
//! descriptor before returning it.

use tracing::debug;

use crate::core::config::ServiceConfig;
use crate::core::error::{RegistryError, RegistryResult};
use crate::core::types::{Environment, ServiceDescriptor, ServiceType, DEFAULT_HEALTH_PATH};
use crate::registration::validation::{
    default_metadata, default_tags, generate_id, generate_instance_token, validate_descriptor,
    GATEWAY_SERVICE_NAME,
};

/// A platform role with its canonical name and default port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRole {
    pub name: &'static str,
    pub service_type: ServiceType,
    pub default_port: u16,
}

impl ServiceRole {
    pub const fn microservice(name: &'static str, default_port: u16) -> Self {
        Self {
            name,
            service_type: ServiceType::Microservice,
            default_port,
        }
    }

    /// Environment key holding this role's port
    pub fn port_key(&self) -> String {
        format!("{}_PORT", self.name.replace('-', "_").to_ascii_uppercase())
    }
}

pub const API_GATEWAY: ServiceRole = ServiceRole {
    name: GATEWAY_SERVICE_NAME,
    service_type: ServiceType::ApiGateway,
    default_port: 7521,
};
pub const USER_SERVICE: ServiceRole = ServiceRole::microservice("user-service", 7530);
pub const RESUME_SERVICE: ServiceRole = ServiceRole::microservice("resume-service", 7532);
pub const COMPANY_SERVICE: ServiceRole = ServiceRole::microservice("company-service", 7533);
pub const NOTIFICATION_SERVICE: ServiceRole =
    ServiceRole::microservice("notification-service", 7534);
pub const BANNER_SERVICE: ServiceRole = ServiceRole::microservice("banner-service", 7535);
pub const DEV_TEAM_SERVICE: ServiceRole = ServiceRole::microservice("dev-team-service", 7536);
pub const TEMPLATE_SERVICE: ServiceRole = ServiceRole::microservice("template-service", 7537);
pub const STATISTICS_SERVICE: ServiceRole =
    ServiceRole::microservice("statistics-service", 7538);
pub const JOB_SERVICE: ServiceRole = ServiceRole::microservice("job-service", 7539);

/// Every role the platform runs
pub const KNOWN_ROLES: [ServiceRole; 10] = [
    API_GATEWAY,
    USER_SERVICE,
    RESUME_SERVICE,
    COMPANY_SERVICE,
    NOTIFICATION_SERVICE,
    BANNER_SERVICE,
    DEV_TEAM_SERVICE,
    TEMPLATE_SERVICE,
    STATISTICS_SERVICE,
    JOB_SERVICE,
];

/// Look up a role by its service name
pub fn role_by_name(name: &str) -> Option<ServiceRole> {
    KNOWN_ROLES.iter().copied().find(|role| role.name == name)
}

/// Descriptor builder bound to the process-wide identity
#[derive(Debug, Clone)]
pub struct Registrar {
    environment: Environment,
    version: String,
    hostname: String,
    address: String,
}

impl Registrar {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            environment: config.environment,
            version: config.version.clone(),
            hostname: config.hostname.clone(),
            address: config.address.clone(),
        }
    }

    /// Build the descriptor of a role on an explicit port
    pub fn build(&self, role: ServiceRole, port: u16) -> RegistryResult<ServiceDescriptor> {
        self.describe(role.name, role.service_type, port)
    }

    fn describe(
        &self,
        name: &str,
        service_type: ServiceType,
        port: u16,
    ) -> RegistryResult<ServiceDescriptor> {
        let token = generate_instance_token(&self.hostname, port);
        let descriptor =
            ServiceDescriptor::new(generate_id(name, &token), name, self.address.clone(), port)
                .with_tags(default_tags(service_type, &self.version))
                .with_metadata(default_metadata(service_type, &self.version, self.environment))
                .with_health_path(DEFAULT_HEALTH_PATH);

        validate_descriptor(&descriptor)?;

        debug!(
            service_id = %descriptor.id,
            service_name = %descriptor.name,
            port = port,
            "Built service descriptor"
        );
        Ok(descriptor)
    }

    /// Build the descriptor of a role, reading its port through `lookup`
    pub fn build_with<F>(&self, role: ServiceRole, lookup: F) -> RegistryResult<ServiceDescriptor>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = port_from(role, lookup)?;
        self.build(role, port)
    }

    /// Build the descriptor of a role, reading its port from the process environment
    pub fn build_from_env(&self, role: ServiceRole) -> RegistryResult<ServiceDescriptor> {
        self.build_with(role, |key| std::env::var(key).ok())
    }

    pub fn api_gateway(&self, port: u16) -> RegistryResult<ServiceDescriptor> {
        self.build(API_GATEWAY, port)
    }

    /// Build a microservice descriptor for any `*-service` name, known role or not
    pub fn microservice(&self, name: &str, port: u16) -> RegistryResult<ServiceDescriptor> {
        self.describe(name, ServiceType::Microservice, port)
    }
}

/// Port of a role: the `<ROLE>_PORT` value when set, the role default otherwise
pub fn port_from<F>(role: ServiceRole, lookup: F) -> RegistryResult<u16>
where
    F: Fn(&str) -> Option<String>,
{
    let key = role.port_key();
    match lookup(&key).filter(|value| !value.trim().is_empty()) {
        Some(value) => match value.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(RegistryError::config(format!(
                "Invalid {}: '{}' is not a port",
                key, value
            ))),
        },
        None => Ok(role.default_port),
    }
}
