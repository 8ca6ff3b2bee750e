//! Certificate signing through an external signer process.
//!
//! The signer receives the CSR on stdin and must print a PEM certificate on
//! stdout. Any non-zero exit is a failure and stderr is kept as the
//! diagnostic. Each call is bounded by a hard timeout, after which the child
//! is killed.

pub mod lemur;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Hard limit on one signer invocation.
pub const SIGNER_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from running a signer.
#[derive(Error, Debug)]
pub enum SignerError {
    /// The process could not be started or talked to.
    #[error("failed to run signer {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The signer did not exit in time and was killed.
    #[error("signer did not finish within {0:?}")]
    Timeout(Duration),

    /// Non-zero exit.
    #[error("signer exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    /// Exit 0 but nothing on stdout.
    #[error("signer returned an empty response")]
    EmptyResponse,

    /// Required setting missing.
    #[error("signer misconfigured: {0}")]
    Config(String),
}

/// Settings for the test signer.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct FakeSignerConfig {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub passphrase: String,
}

/// Settings for the lemur signer binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct LemurSignerConfig {
    pub bin: String,
    /// Bearer token, usually a `lookup_secret::` reference.
    pub key: String,
    pub endpoint: String,
    pub authority: String,
    pub owner: String,
    #[serde(default = "default_valid_years")]
    pub valid_years: u32,
}

fn default_valid_years() -> u32 {
    1
}

/// Which signer to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerKind {
    Fake(FakeSignerConfig),
    Lemur(LemurSignerConfig),
}

/// A configured signer command.
#[derive(Debug, Clone)]
pub struct Signer {
    kind: SignerKind,
    timeout: Duration,
    debug: bool,
}

impl Signer {
    #[must_use]
    pub fn new(kind: SignerKind) -> Self {
        Self {
            kind,
            timeout: SIGNER_TIMEOUT,
            debug: false,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set `DEBUG_SIGNER=1` for the child.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &SignerKind {
        &self.kind
    }

    fn command(&self, common_name: &str) -> Result<SignerCommand, SignerError> {
        let mut env = BTreeMap::new();
        if self.debug {
            env.insert("DEBUG_SIGNER".to_string(), "1".to_string());
        }

        let (program, args) = match &self.kind {
            SignerKind::Fake(cfg) => {
                if cfg.bin.is_empty() {
                    return Err(SignerError::Config("fake signer bin is not set".into()));
                }
                env.insert("PASSPHRASE".to_string(), cfg.passphrase.clone());
                (cfg.bin.clone(), cfg.args.clone())
            }
            SignerKind::Lemur(cfg) => {
                if cfg.bin.is_empty() {
                    return Err(SignerError::Config("lemur signer bin is not set".into()));
                }
                env.insert("KEY".to_string(), cfg.key.clone());
                env.insert("ENDPOINT".to_string(), cfg.endpoint.clone());
                let args = vec![
                    "--valid-years".to_string(),
                    cfg.valid_years.to_string(),
                    "--authority".to_string(),
                    cfg.authority.clone(),
                    "--owner".to_string(),
                    cfg.owner.clone(),
                    "--common-name".to_string(),
                    common_name.to_string(),
                ];
                (cfg.bin.clone(), args)
            }
        };

        Ok(SignerCommand {
            program: PathBuf::from(program),
            args,
            env,
            timeout: self.timeout,
        })
    }

    /// Sign a PEM CSR and return the signer's stdout.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] on spawn failure, timeout, non-zero exit or an
    /// empty response.
    pub async fn sign(&self, csr: &[u8], common_name: &str) -> Result<Vec<u8>, SignerError> {
        let command = self.command(common_name)?;
        let output = command.run(csr).await?;
        if output.iter().all(u8::is_ascii_whitespace) {
            return Err(SignerError::EmptyResponse);
        }
        Ok(output)
    }
}

/// A fully resolved signer invocation.
#[derive(Debug, Clone)]
pub struct SignerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl SignerCommand {
    /// Run once, feeding `input` on stdin.
    ///
    /// The child gets its own process group so a terminal interrupt aimed
    /// at the orchestrator does not reach it. On timeout the whole group is
    /// killed, including anything the signer forked.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError`] on spawn failure, timeout or non-zero exit.
    pub async fn run(&self, input: &[u8]) -> Result<Vec<u8>, SignerError> {
        let program = self.program.display().to_string();
        debug!(program = %program, args = ?self.args, "Invoking signer");

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| SignerError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();

        let exchange = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(input).await {
                    Ok(()) => {}
                    // Signers that never read stdin close the pipe early.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                }
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(SignerError::Spawn { program, source }),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                return Err(SignerError::Timeout(self.timeout));
            }
        };

        if !output.status.success() {
            return Err(SignerError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // The group was created with process_group(0), so its id is the leader's pid.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: every member already exited.
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "Failed to kill signer process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(script: &str) -> Signer {
        Signer::new(SignerKind::Fake(FakeSignerConfig {
            bin: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            passphrase: "pass".into(),
        }))
    }

    #[test]
    fn test_lemur_command_arguments() {
        let signer = Signer::new(SignerKind::Lemur(LemurSignerConfig {
            bin: "/usr/local/bin/lemur-signer".into(),
            key: "tok".into(),
            endpoint: "https://lemur.example/api/1/certificates".into(),
            authority: "internal-ca".into(),
            owner: "ops@example.net".into(),
            valid_years: 2,
        }))
        .with_debug(true);

        let cmd = signer.command("bmc-1.example.net").unwrap();
        assert_eq!(
            cmd.args,
            vec![
                "--valid-years",
                "2",
                "--authority",
                "internal-ca",
                "--owner",
                "ops@example.net",
                "--common-name",
                "bmc-1.example.net"
            ]
        );
        assert_eq!(cmd.env.get("KEY").map(String::as_str), Some("tok"));
        assert_eq!(cmd.env.get("DEBUG_SIGNER").map(String::as_str), Some("1"));
        assert_eq!(cmd.timeout, SIGNER_TIMEOUT);
    }

    #[test]
    fn test_missing_bin_is_config_error() {
        let signer = Signer::new(SignerKind::Fake(FakeSignerConfig::default()));
        assert!(matches!(signer.command("x"), Err(SignerError::Config(_))));
    }

    #[tokio::test]
    async fn test_sign_echoes_stdin() {
        let out = fake("cat").sign(b"CSR-BYTES", "cn").await.unwrap();
        assert_eq!(out, b"CSR-BYTES");
    }

    #[tokio::test]
    async fn test_sign_passes_passphrase_env() {
        let out = fake("printf '%s' \"$PASSPHRASE\"").sign(b"", "cn").await.unwrap();
        assert_eq!(out, b"pass");
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let err = fake("echo 'authority rejected' >&2; exit 3")
            .sign(b"csr", "cn")
            .await
            .unwrap_err();
        match err {
            SignerError::Failed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "authority rejected");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_output_rejected() {
        let err = fake("true").sign(b"csr", "cn").await.unwrap_err();
        assert!(matches!(err, SignerError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let signer = Signer::new(SignerKind::Fake(FakeSignerConfig {
            bin: "/nonexistent/signer".into(),
            ..FakeSignerConfig::default()
        }));
        let err = signer.sign(b"csr", "cn").await.unwrap_err();
        assert!(matches!(err, SignerError::Spawn { .. }));
    }
}
