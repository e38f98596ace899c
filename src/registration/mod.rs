pub mod registrar;
pub mod validation;

pub use registrar::{role_by_name, Registrar, ServiceRole, KNOWN_ROLES};
pub use validation::{
    default_metadata, default_tags, generate_id, generate_instance_token, validate_descriptor,
    validate_id, validate_metadata, validate_name, validate_tags, validate_version,
};
