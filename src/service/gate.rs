// src/service/gate.rs

//! Pre-launch checks: config syntax and certificate counts.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::ServiceDescriptor;
use crate::config::rewrite::{self, ParseFailure};

/// Why a service may not start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// A listed config file does not exist
    MissingConfig(PathBuf),

    /// A config file could not be read
    UnreadableConfig {
        /// File path
        path: PathBuf,
        /// I/O error text
        error: String,
    },

    /// A config file failed the structural parse
    ConfigSyntax {
        /// File path
        path: PathBuf,
        /// Failing line
        failure: ParseFailure,
    },

    /// Fewer certificate files than required
    CertificateShortfall {
        /// Files found
        found: usize,
        /// Files required
        required: usize,
    },
}

/// One failed check of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Service abbreviation
    pub service: String,

    /// Failed check
    pub reason: FailureReason,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FailureReason::MissingConfig(path) => {
                write!(f, "{}: config file {} is missing", self.service, path.display())
            }
            FailureReason::UnreadableConfig { path, error } => {
                write!(f, "{}: cannot read {}: {}", self.service, path.display(), error)
            }
            FailureReason::ConfigSyntax { path, failure } => {
                write!(f, "{}: {}: {}", self.service, path.display(), failure)
            }
            FailureReason::CertificateShortfall { found, required } => write!(
                f,
                "{}: {} certificate files found, {} required",
                self.service, found, required
            ),
        }
    }
}

/// Gate errors
#[derive(Debug, Error)]
pub enum GateError {
    #[error("{} validation failure(s):\n{}", .0.len(), render_failures(.0))]
    Validation(Vec<ValidationFailure>),
}

fn render_failures(failures: &[ValidationFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  - {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Counts regular files under every directory, recursively; missing directories count zero
pub fn count_certificates(dirs: &[PathBuf]) -> usize {
    dirs.iter()
        .map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .count()
        })
        .sum()
}

/// Structural check of every config file of a service.
///
/// A parse failure on a line holding a templated placeholder such as
/// `<SUBZONE_ID>` is logged and otherwise ignored.
pub fn validate_config(service: &ServiceDescriptor) -> Option<ValidationFailure> {
    for path in service.config_paths() {
        let failure = |reason| {
            Some(ValidationFailure {
                service: service.abbreviation.clone(),
                reason,
            })
        };

        if !path.exists() {
            return failure(FailureReason::MissingConfig(path));
        }

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                return failure(FailureReason::UnreadableConfig {
                    path,
                    error: e.to_string(),
                })
            }
        };

        if let Err(parse) = rewrite::check_syntax(&contents) {
            if parse.is_templated_placeholder() {
                warn!(
                    "{}: ignoring parse error in {} on templated line {}",
                    service.abbreviation,
                    path.display(),
                    parse.line
                );
                continue;
            }
            return failure(FailureReason::ConfigSyntax { path, failure: parse });
        }
    }
    None
}

/// Compares the certificate file count with the service's requirement
pub fn validate_certificates(service: &ServiceDescriptor) -> Option<ValidationFailure> {
    let requirement = service.certificate_requirement()?;
    let found = requirement.count();
    if found >= requirement.required {
        return None;
    }
    Some(ValidationFailure {
        service: service.abbreviation.clone(),
        reason: FailureReason::CertificateShortfall {
            found,
            required: requirement.required,
        },
    })
}

/// Outcome of gating a set of services
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    lines: Vec<String>,
    failures: Vec<ValidationFailure>,
}

impl GateReport {
    /// One ✅/❌ line per service
    pub fn checklist(&self) -> String {
        self.lines.join("\n")
    }

    /// Every failure, in service order
    pub fn failures(&self) -> &[ValidationFailure] {
        &self.failures
    }

    /// Whether every service passed
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Converts to the aggregate error
    pub fn into_result(self) -> Result<(), GateError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(GateError::Validation(self.failures))
        }
    }
}

/// Runs both checks on every service and logs the checklist
pub fn check_all(services: &[ServiceDescriptor]) -> GateReport {
    let mut report = GateReport::default();

    for service in services {
        let failures: Vec<ValidationFailure> = validate_config(service)
            .into_iter()
            .chain(validate_certificates(service))
            .collect();

        if failures.is_empty() {
            report.lines.push(format!("✅ {}", service.abbreviation));
        } else {
            let reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
            report.lines.push(format!("❌ {}", reasons.join("; ")));
            report.failures.extend(failures);
        }
    }

    if report.passed() {
        info!("Pre-launch checks:\n{}", report.checklist());
    } else {
        error!("Pre-launch checks:\n{}", report.checklist());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::descriptor;
    use crate::service::{CertificateRequirement, ServiceKind};

    fn gated(name: &str, dir: &Path, cert_dirs: &[&str], required: usize) -> ServiceDescriptor {
        let mut service = descriptor(
            name,
            dir,
            ServiceKind::Deployable(CertificateRequirement {
                dirs: cert_dirs.iter().map(|d| dir.join(d)).collect(),
                required,
            }),
        );
        service.config_files = vec![format!("{}.conf", name)];
        service
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn counts_are_recursive_and_summed() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("public/certificates/a.jks"), "");
        write(&dir.path().join("private/certificates/b.jks"), "");
        write(&dir.path().join("private/certificates/nested/c.jks"), "");

        let dirs = vec![
            dir.path().join("public/certificates"),
            dir.path().join("private/certificates"),
            dir.path().join("absent"),
        ];
        assert_eq!(count_certificates(&dirs), 3);
    }

    #[test]
    fn shortfall_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("certificates/a.jks"), "");
        let service = gated("signer", dir.path(), &["certificates"], 2);

        let failure = validate_certificates(&service).unwrap();
        assert_eq!(
            failure.reason,
            FailureReason::CertificateShortfall { found: 1, required: 2 }
        );
        assert_eq!(
            failure.to_string(),
            "signer: 1 certificate files found, 2 required"
        );
    }

    #[test]
    fn placeholder_lines_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("nmap.conf"),
            "address = \"localhost:20000\"\nsubZoneID = <SUBZONE_ID>\n",
        );
        let service = gated("nmap", dir.path(), &[], 0);

        assert_eq!(validate_config(&service), None);
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("zone.conf"), "a = 1\nb = {\n");
        let service = gated("zone", dir.path(), &[], 0);

        match validate_config(&service).map(|f| f.reason) {
            Some(FailureReason::ConfigSyntax { failure, .. }) => assert_eq!(failure.line, 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn check_all_aggregates_every_failure() {
        let root = tempfile::tempdir().unwrap();
        let ok_dir = root.path().join("ok");
        write(&ok_dir.join("ok.conf"), "a = 1\n");
        write(&ok_dir.join("certificates/a.jks"), "");

        let bad_dir = root.path().join("bad");
        fs::create_dir_all(&bad_dir).unwrap();

        let services = vec![
            gated("ok", &ok_dir, &["certificates"], 1),
            gated("bad", &bad_dir, &["certificates"], 3),
        ];

        let report = check_all(&services);
        assert_eq!(report.failures().len(), 2);
        assert!(report.checklist().starts_with("✅ ok\n❌ bad: config file"));

        let err = report.into_result().unwrap_err();
        let GateError::Validation(failures) = &err;
        assert!(failures.iter().all(|f| f.service == "bad"));
        assert!(err.to_string().starts_with("2 validation failure(s):"));
    }
}
