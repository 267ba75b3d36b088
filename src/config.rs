//! CLI (clap) + environment parsing, merged into a single `RuntimeConfig`
//! (spec §6 "Command surface", "Environment").

use std::path::PathBuf;

use clap::{ArgGroup, Parser, ValueEnum};

use crate::error::BridgeError;
use crate::tools::ProjectionPolicy;

///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

#[derive(Debug, Parser)]
#[command(
    name = "odata-mcp-bridge",
    about = "Bridges an OData v2 service into a set of remotely-callable MCP tools",
    group(ArgGroup::new("credentials").args(["cookie_file", "cookie_string"]).conflicts_with("user")),
    group(ArgGroup::new("read_only_modes").args(["read_only", "read_only_but_functions"])),
    group(ArgGroup::new("code_filters").args(["enable", "disable"])),
)]
pub struct Cli {
    /// OData service base URL (positional form).
    #[arg(value_name = "SERVICE_URL")]
    pub service_positional: Option<String>,

    /// OData service base URL (flag form; overrides positional).
    #[arg(long = "service", env = "ODATA_SERVICE_URL")]
    pub service: Option<String>,

    #[arg(long = "user", env = "ODATA_USERNAME")]
    pub user: Option<String>,

    #[arg(long = "password", env = "ODATA_PASSWORD")]
    pub password: Option<String>,

    #[arg(long = "cookie-file", env = "ODATA_COOKIE_FILE")]
    pub cookie_file: Option<PathBuf>,

    #[arg(long = "cookie-string", env = "ODATA_COOKIE_STRING")]
    pub cookie_string: Option<String>,

    #[arg(short, long)]
    pub verbose: bool,

    /// Print the fully synthesized tool table as JSON and exit.
    #[arg(long)]
    pub trace: bool,

    /// Append raw RPC frames to a per-platform temp file.
    #[arg(long)]
    pub trace_mcp: bool,

    #[arg(long = "tool-prefix")]
    pub tool_prefix: Option<String>,

    #[arg(long = "tool-postfix")]
    pub tool_postfix: Option<String>,

    #[arg(long = "no-postfix")]
    pub no_postfix: bool,

    #[arg(long = "tool-shrink")]
    pub tool_shrink: bool,

    /// Entity-set allowlist, `*`/`?` wildcards, may repeat.
    #[arg(long = "entities", value_delimiter = ',')]
    pub entities: Vec<String>,

    /// Function-import allowlist, `*`/`?` wildcards, may repeat.
    #[arg(long = "functions", value_delimiter = ',')]
    pub functions: Vec<String>,

    #[arg(long = "no-sort-tools", action = clap::ArgAction::SetTrue)]
    pub no_sort_tools: bool,

    #[arg(long = "pagination-hints")]
    pub pagination_hints: bool,

    #[arg(long = "no-legacy-dates", action = clap::ArgAction::SetTrue)]
    pub no_legacy_dates: bool,

    #[arg(long = "verbose-errors")]
    pub verbose_errors: bool,

    #[arg(long = "response-metadata")]
    pub response_metadata: bool,

    #[arg(long = "max-response-size", default_value_t = 5 * 1024 * 1024)]
    pub max_response_size: usize,

    #[arg(long = "max-items", default_value_t = 100)]
    pub max_items: usize,

    #[arg(long = "read-only", visible_alias = "ro")]
    pub read_only: bool,

    #[arg(long = "read-only-but-functions", visible_alias = "robf")]
    pub read_only_but_functions: bool,

    /// Operation codes to enable, from the alphabet `{C,S,F,G,U,D,A,R}`.
    #[arg(long = "enable", value_delimiter = ',')]
    pub enable: Vec<char>,

    /// Operation codes to disable, from the same alphabet.
    #[arg(long = "disable", value_delimiter = ',')]
    pub disable: Vec<char>,

    #[arg(long = "hints-file")]
    pub hints_file: Option<PathBuf>,

    /// Inline advisory JSON (or plain text) merged into the info tool.
    #[arg(long = "hint")]
    pub hint: Option<String>,

    #[arg(long = "info-tool-name", default_value = crate::info::DEFAULT_INFO_TOOL_NAME)]
    pub info_tool_name: String,

    #[arg(long = "transport", value_enum, default_value = "stdio")]
    pub transport: TransportKind,

    #[arg(long = "http-addr", default_value = "127.0.0.1:8765")]
    pub http_addr: String,

    /// Required to bind `--http-addr` to a non-localhost address.
    #[arg(long = "allow-non-localhost-bind")]
    pub allow_non_localhost_bind: bool,
}

///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub service_url: String,
    pub auth: crate::session::Auth,
    pub verbose: bool,
    pub trace: bool,
    pub trace_mcp: bool,
    pub policy: ProjectionPolicy,
    pub max_response_size: usize,
    pub max_items: usize,
    pub pagination_hints: bool,
    pub legacy_dates: bool,
    pub verbose_errors: bool,
    pub response_metadata: bool,
    pub hints_file: Option<PathBuf>,
    pub hint: Option<String>,
    pub info_tool_name: String,
    pub transport: TransportKind,
    pub http_addr: String,
    pub allow_non_localhost_bind: bool,
}

impl RuntimeConfig {
    /// Loads a project-local `.env` (via `dotenvy`) *before* parsing CLI
    /// args, so CLI flags and real environment variables both take
    /// precedence over a checked-in dotfile (spec §6 precedence: CLI >
    /// env > project-local dotfile).
    pub fn load() -> Result<Self, BridgeError> {
        let _ = dotenvy::dotenv();
        let cli = Cli::parse();
        Self::from_cli(cli)
    }

    pub fn from_cli(cli: Cli) -> Result<Self, BridgeError> {
        // `ODATA_URL`/`ODATA_USER`/`ODATA_PASS` are alternate env var names
        // (spec §6 "Environment") that clap's single-name `env` attribute
        // can't express; fall back to them by hand, lowest precedence.
        let service_url = cli
            .service
            .or(cli.service_positional)
            .or_else(|| std::env::var("ODATA_URL").ok())
            .ok_or_else(|| BridgeError::ArgumentError("no OData service URL supplied".to_string()))?;
        let service_url = if service_url.ends_with('/') {
            service_url
        } else {
            format!("{service_url}/")
        };

        let user = cli.user.or_else(|| std::env::var("ODATA_USER").ok());
        let password = cli.password.or_else(|| std::env::var("ODATA_PASS").ok());

        let auth = if let Some(cookie_string) = &cli.cookie_string {
            crate::session::Auth::Cookies { jar: cookie_string.clone() }
        } else if let Some(path) = &cli.cookie_file {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| BridgeError::ArgumentError(format!("cannot read cookie file {}: {e}", path.display())))?;
            crate::session::Auth::Cookies { jar: contents }
        } else if let (Some(user), Some(pass)) = (&user, &password) {
            crate::session::Auth::Basic { user: user.clone(), pass: pass.clone() }
        } else {
            crate::session::Auth::None
        };

        if !cli.allow_non_localhost_bind && cli.transport == TransportKind::Http {
            let is_localhost = cli.http_addr.starts_with("127.") || cli.http_addr.starts_with("localhost") || cli.http_addr.starts_with("[::1]");
            if !is_localhost {
                return Err(BridgeError::ArgumentError(format!(
                    "refusing to bind HTTP transport to non-localhost address {} without --allow-non-localhost-bind (this transport has no authentication)",
                    cli.http_addr
                )));
            }
        }

        let enable = if cli.enable.is_empty() { None } else { Some(cli.enable.clone()) };

        let policy = ProjectionPolicy {
            mode_read_only: cli.read_only,
            mode_read_only_but_functions: cli.read_only_but_functions,
            disable: cli.disable,
            enable,
            entity_allowlist: cli.entities,
            function_allowlist: cli.functions,
            name_shrink: cli.tool_shrink,
            sort_tools: !cli.no_sort_tools,
            prefix_mode: cli.tool_prefix.is_some(),
            custom_prefix: cli.tool_prefix,
            custom_postfix: cli.tool_postfix,
            no_postfix: cli.no_postfix,
        };

        Ok(Self {
            service_url,
            auth,
            verbose: cli.verbose,
            trace: cli.trace,
            trace_mcp: cli.trace_mcp,
            policy,
            max_response_size: cli.max_response_size,
            max_items: cli.max_items,
            pagination_hints: cli.pagination_hints,
            legacy_dates: !cli.no_legacy_dates,
            verbose_errors: cli.verbose_errors,
            response_metadata: cli.response_metadata,
            hints_file: cli.hints_file,
            hint: cli.hint,
            info_tool_name: cli.info_tool_name,
            transport: cli.transport,
            http_addr: cli.http_addr,
            allow_non_localhost_bind: cli.allow_non_localhost_bind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["odata-mcp-bridge"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn basic_auth_from_user_and_password() {
        let cli = parse(&["--service", "https://x/", "--user", "u", "--password", "p"]);
        let cfg = RuntimeConfig::from_cli(cli).unwrap();
        assert!(matches!(cfg.auth, crate::session::Auth::Basic { .. }));
    }

    #[test]
    fn service_url_gains_trailing_slash() {
        let cli = parse(&["--service", "https://x"]);
        let cfg = RuntimeConfig::from_cli(cli).unwrap();
        assert_eq!(cfg.service_url, "https://x/");
    }

    #[test]
    fn non_localhost_http_bind_rejected_without_override() {
        let cli = parse(&["--service", "https://x/", "--transport", "http", "--http-addr", "0.0.0.0:8080"]);
        assert!(RuntimeConfig::from_cli(cli).is_err());
    }

    #[test]
    fn non_localhost_http_bind_allowed_with_override() {
        let cli = parse(&[
            "--service", "https://x/", "--transport", "http", "--http-addr", "0.0.0.0:8080", "--allow-non-localhost-bind",
        ]);
        assert!(RuntimeConfig::from_cli(cli).is_ok());
    }

    #[test]
    fn missing_service_url_is_an_argument_error() {
        let cli = parse(&[]);
        assert!(matches!(RuntimeConfig::from_cli(cli), Err(BridgeError::ArgumentError(_))));
    }
}
