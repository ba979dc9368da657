// src/bootstrap/admin_cli.rs

//! Wrapper around the network administration command line tool.
//!
//! Every command runs inside its own login/logout pair; the tool keeps its
//! session in a context file, so nothing is carried between invocations.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::config::AdminToolConfig;
use crate::config::DeploymentConfig;
use crate::execution::{BoxedExecutor, CommandSpec, ExecutionError};

static SUBZONE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)(?:^|[{,\s])"?id"?\s*[:=]\s*"?([A-Za-z0-9-]+)"#).expect("subzone id pattern is valid")
});

/// Administration tool client
pub struct AdminCli {
    executor: BoxedExecutor,
    program: String,
    base_args: Vec<String>,
    cwd: PathBuf,
    url: String,
    username: String,
    password: SecretString,
}

impl AdminCli {
    /// Creates a client from the tool settings, the tool directory resolved
    /// against the deployment root
    pub fn new(
        executor: BoxedExecutor,
        tool: &AdminToolConfig,
        config: &DeploymentConfig,
        password: SecretString,
    ) -> Self {
        Self {
            executor,
            program: tool.program.clone(),
            base_args: tool.args.clone(),
            cwd: config.resolve(&tool.dir),
            url: tool.url.clone(),
            username: tool.username.clone(),
            password,
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program)
            .args(&self.base_args)
            .current_dir(&self.cwd)
    }

    async fn login(&self) -> Result<(), ExecutionError> {
        let spec = self
            .command()
            .args(["context", "login", "-s", self.url.as_str(), "-u", self.username.as_str(), "-p"])
            .secret_arg(self.password.expose_secret().as_str());
        self.executor.execute(&spec).await?;
        Ok(())
    }

    async fn logout(&self) -> Result<(), ExecutionError> {
        let spec = self.command().args(["context", "logout", self.url.as_str()]);
        self.executor.execute(&spec).await?;
        Ok(())
    }

    /// Runs one tool command between a login and a logout, returning its stdout
    pub async fn run<I, S>(&self, args: I) -> Result<String, ExecutionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.command().args(args);
        debug!("admin tool: {}", spec);

        self.login().await?;
        let result = self.executor.execute(&spec).await;
        if let Err(e) = self.logout().await {
            warn!("Failed to log out of {}: {}", self.url, e);
        }
        Ok(result?.stdout)
    }
}

/// Token printed by a `--zone-token` command: its last non-empty line
pub fn token_from(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(|line| line.trim_matches('"').to_string())
}

/// Subzone ids listed by `zone get-subzones`, in output order
pub fn parse_subzone_ids(output: &str) -> Vec<String> {
    SUBZONE_ID
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fake::FakeExecutor;
    use crate::execution::CommandOutput;
    use crate::service::tests::config_at;

    fn client(executor: BoxedExecutor) -> AdminCli {
        let config = config_at(std::path::Path::new("/srv/network"));
        AdminCli::new(
            executor,
            &config.subzone.admin_tool,
            &config,
            SecretString::new("p4ssWord".to_string()),
        )
    }

    #[tokio::test]
    async fn commands_are_wrapped_in_a_session() {
        let executor = FakeExecutor::new();
        executor.set_handler(Box::new(|spec| {
            if spec.args.iter().any(|a| a == "get-subzones") {
                CommandOutput::success("[]\n")
            } else {
                CommandOutput::success("")
            }
        }));
        let cli = client(executor.clone());

        let out = cli.run(["zone", "get-subzones"]).await.unwrap();
        assert_eq!(out, "[]\n");

        let lines = executor.command_lines();
        assert_eq!(
            lines,
            vec![
                "-jar cenm-tool.jar context login -s http://127.0.0.1:8089 -u admin -p p4ssWord",
                "-jar cenm-tool.jar zone get-subzones",
                "-jar cenm-tool.jar context logout http://127.0.0.1:8089",
            ]
        );
        let calls = executor.calls();
        assert_eq!(calls[0].cwd.as_deref(), Some(std::path::Path::new("/srv/network/cenm-tool")));
        assert!(!calls[0].to_string().contains("p4ssWord"));
    }

    #[tokio::test]
    async fn failed_command_still_logs_out() {
        let executor = FakeExecutor::new();
        executor.set_handler(Box::new(|spec| {
            if spec.args.iter().any(|a| a == "create-subzone") {
                CommandOutput::failure(1, "zone exists")
            } else {
                CommandOutput::success("")
            }
        }));
        let cli = client(executor.clone());

        let err = cli.run(["zone", "create-subzone"]).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CommandFailed { .. }));
        assert!(executor.command_lines()[2].contains("context logout"));
    }

    #[test]
    fn token_is_the_last_line() {
        assert_eq!(token_from("Setting config...\n\nabc-123\n").as_deref(), Some("abc-123"));
        assert_eq!(token_from("\"quoted\"\n").as_deref(), Some("quoted"));
        assert_eq!(token_from("  \n"), None);
    }

    #[test]
    fn subzone_ids_from_json_listing() {
        let output = r##"[ {
  "id" : 1,
  "label" : "Main",
  "labelColor" : "#941213"
}, {
  "id" : "a-2"
} ]"##;
        assert_eq!(parse_subzone_ids(output), vec!["1", "a-2"]);
    }

    #[test]
    fn malformed_listing_means_no_subzones() {
        assert!(parse_subzone_ids("").is_empty());
        assert!(parse_subzone_ids("Error: not logged in").is_empty());
        assert!(parse_subzone_ids("subzoneId: 7").is_empty());
    }

    #[test]
    fn hyphenated_id_keys_are_not_subzone_ids() {
        assert!(parse_subzone_ids("zone-id: 3\nparent-id=4").is_empty());
        assert_eq!(parse_subzone_ids(r#"{"id":5,"parent-id":9}"#), vec!["5"]);
        assert_eq!(parse_subzone_ids("id=7"), vec!["7"]);
    }
}
