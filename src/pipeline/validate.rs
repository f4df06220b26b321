//! Request validation.
//!
//! Runs before admission. A request that fails here never creates a
//! session and never reaches the exchange executor.

use crate::catalog::TechnologyCatalog;
use crate::error::DocOpsError;
use crate::exchange::OperationRequest;
use tracing::debug;

/// Check `request` against the family's declared arity and the inputs on
/// disk.
pub fn validate_request(
    catalog: &TechnologyCatalog,
    request: &OperationRequest,
) -> Result<(), DocOpsError> {
    let family = &request.family;
    let spec = catalog
        .family_spec(family)
        .ok_or_else(|| DocOpsError::UnknownFamily(family.to_string()))?;
    if !catalog.supports(family) {
        return Err(DocOpsError::UnknownFamily(family.to_string()));
    }

    let invalid = |reason: String| DocOpsError::Validation {
        family: family.clone(),
        reason,
    };

    let n = request.inputs.len();
    if n < spec.min_inputs {
        return Err(invalid(format!(
            "expects at least {} input file(s), got {}",
            spec.min_inputs, n
        )));
    }
    if let Some(max) = spec.max_inputs {
        if n > max {
            return Err(invalid(format!(
                "expects at most {} input file(s), got {}",
                max, n
            )));
        }
    }

    for input in &request.inputs {
        if input.name.trim().is_empty() {
            return Err(invalid(format!(
                "input '{}' has an empty name",
                input.path.display()
            )));
        }
        if !input.path.is_file() {
            return Err(DocOpsError::InputNotFound {
                path: input.path.clone(),
            });
        }
    }

    if !(request.params.is_object() || request.params.is_null()) {
        return Err(invalid("parameters must be a JSON object".into()));
    }

    debug!("Validated '{}' request with {} input(s)", family, n);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::OperationFamily;
    use crate::exchange::InputArtifact;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fam(name: &str) -> OperationFamily {
        OperationFamily::new(name).unwrap()
    }

    fn pdf() -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"%PDF-1.7\n").unwrap();
        f
    }

    #[test]
    fn accepts_well_formed_request() {
        let f = pdf();
        let req = OperationRequest::new(fam("compress")).with_input(InputArtifact::from_path(f.path()));
        validate_request(&TechnologyCatalog::builtin(), &req).unwrap();
    }

    #[test]
    fn merge_needs_two_inputs() {
        let f = pdf();
        let req = OperationRequest::new(fam("merge")).with_input(InputArtifact::from_path(f.path()));
        let err = validate_request(&TechnologyCatalog::builtin(), &req).unwrap_err();
        assert!(matches!(err, DocOpsError::Validation { .. }), "{err}");
    }

    #[test]
    fn too_many_inputs() {
        let (a, b) = (pdf(), pdf());
        let req = OperationRequest::new(fam("compress"))
            .with_input(InputArtifact::from_path(a.path()))
            .with_input(InputArtifact::from_path(b.path()));
        assert!(validate_request(&TechnologyCatalog::builtin(), &req).is_err());
    }

    #[test]
    fn missing_file() {
        let req = OperationRequest::new(fam("compress"))
            .with_input(InputArtifact::from_path("/definitely/not/here.pdf"));
        let err = validate_request(&TechnologyCatalog::builtin(), &req).unwrap_err();
        assert!(matches!(err, DocOpsError::InputNotFound { .. }));
    }

    #[test]
    fn unknown_family() {
        let req = OperationRequest::new(fam("teleport"));
        let err = validate_request(&TechnologyCatalog::builtin(), &req).unwrap_err();
        assert!(matches!(err, DocOpsError::UnknownFamily(_)));
    }

    #[test]
    fn params_must_be_an_object() {
        let f = pdf();
        let req = OperationRequest::new(fam("compress"))
            .with_input(InputArtifact::from_path(f.path()))
            .with_params(serde_json::json!([1, 2]));
        assert!(validate_request(&TechnologyCatalog::builtin(), &req).is_err());
    }

    #[test]
    fn generation_takes_no_inputs() {
        let req = OperationRequest::new(fam("generate_document"))
            .with_params(serde_json::json!({"prompt": "quarterly report"}));
        validate_request(&TechnologyCatalog::builtin(), &req).unwrap();
    }
}
