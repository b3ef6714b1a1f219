//! Request validation for the manager's create endpoints.

use thiserror::Error;

use crate::types::{CreateEndpoint, CreateLambda, CreateRuntime};

/// Pattern every endpoint path must match: one or more non-empty segments,
/// no trailing slash.
pub const ENDPOINT_PATH_PATTERN: &str = "^(/[0-9a-zA-Z-_]+)+$";

/// Caller input was malformed.
#[derive(Debug, Error, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub String);

fn required(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError(format!("'{field}' is required")));
    }
    Ok(())
}

pub fn validate_create_lambda(req: &CreateLambda) -> Result<(), ValidationError> {
    required("name", &req.name)?;
    required("runtime", &req.runtime)?;
    required("lambda_type", &req.lambda_type)?;
    required("archive", &req.archive)?;

    if req.lambda_type != "ENDPOINT" && req.lambda_type != "INTERNAL" {
        return Err(ValidationError(format!(
            "invalid 'lambda_type' value: {}",
            req.lambda_type
        )));
    }

    Ok(())
}

pub fn validate_create_runtime(req: &CreateRuntime) -> Result<(), ValidationError> {
    required("name", &req.name)?;
    required("dockerfile", &req.dockerfile)?;
    Ok(())
}

pub fn validate_create_endpoint(req: &CreateEndpoint) -> Result<(), ValidationError> {
    required("name", &req.name)?;
    required("lambda", &req.lambda)?;
    validate_endpoint_path(&req.path)
}

pub fn validate_endpoint_path(path: &str) -> Result<(), ValidationError> {
    let re = regex::Regex::new(ENDPOINT_PATH_PATTERN).expect("endpoint path pattern");
    if !re.is_match(path) {
        return Err(ValidationError(format!(
            "'path' doesn't conform regex: {ENDPOINT_PATH_PATTERN}"
        )));
    }

    Ok(())
}
