//! Subcommand parsing and dispatch
//!
//! Every command produces a JSON value for stdout; failures surface as the
//! client's normalized `ApiError`.

use std::time::{SystemTime, UNIX_EPOCH};

use api_client::{ApiClient, ApiError};
use common::Secret;
use serde_json::{Value, json};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 5;

pub const USAGE: &str = "usage: session-cli [--config <path>] <command>

commands:
  status                       show stored session state
  login <username> [password]  log in (password falls back to API_PASSWORD)
  me                           show the current user
  users [page] [count]         list users
  logout                       clear stored credentials";

#[derive(Debug)]
pub enum Command {
    Status,
    Login {
        username: String,
        password: Secret<String>,
    },
    Me,
    Users {
        page: u32,
        count: u32,
    },
    Logout,
}

impl Command {
    /// Parse positional arguments (program name and `--config` already
    /// removed). `env_password` is the value of API_PASSWORD, if set.
    pub fn parse(args: &[String], env_password: Option<String>) -> Result<Self, String> {
        let (name, rest) = args.split_first().ok_or_else(|| "missing command".to_string())?;
        let command = match name.as_str() {
            "status" => Command::Status,
            "login" => {
                let username = rest
                    .first()
                    .ok_or_else(|| "login requires a username".to_string())?
                    .clone();
                let password = rest
                    .get(1)
                    .cloned()
                    .or(env_password)
                    .ok_or_else(|| "login requires a password or API_PASSWORD".to_string())?;
                Command::Login {
                    username,
                    password: Secret::new(password),
                }
            }
            "me" => Command::Me,
            "users" => Command::Users {
                page: parse_number(rest.first(), "page", DEFAULT_PAGE)?,
                count: parse_number(rest.get(1), "count", DEFAULT_PAGE_SIZE)?,
            },
            "logout" => Command::Logout,
            other => return Err(format!("unknown command: {other}")),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Login { .. } => "login",
            Command::Me => "me",
            Command::Users { .. } => "users",
            Command::Logout => "logout",
        }
    }
}

fn parse_number(arg: Option<&String>, what: &str, default: u32) -> Result<u32, String> {
    match arg {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| format!("{what} must be a non-negative integer, got: {raw}")),
    }
}

/// Split `--config <path>` out of the raw arguments.
pub fn split_config_flag(args: &[String]) -> (Option<String>, Vec<String>) {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config = iter.next().cloned();
        } else {
            rest.push(arg.clone());
        }
    }
    (config, rest)
}

/// Execute a command against the client.
pub async fn run(command: Command, client: &ApiClient) -> Result<Value, ApiError> {
    match command {
        Command::Status => Ok(status(client, unix_now())),
        Command::Login { username, password } => {
            let login = client.login(&username, &password).await?;
            Ok(json!({
                "loggedIn": true,
                "username": username,
                "tokenType": login.token_type,
                "expires": login.expires,
            }))
        }
        Command::Me => Ok(serde_json::to_value(client.current_user().await?)
            .map_err(|e| ApiError::decode(None, e))?),
        Command::Users { page, count } => Ok(serde_json::to_value(
            client.list_users(page, count).await?,
        )
        .map_err(|e| ApiError::decode(None, e))?),
        Command::Logout => {
            client.logout();
            Ok(json!({ "loggedIn": false }))
        }
    }
}

/// Session summary. Token values are never printed.
fn status(client: &ApiClient, now: i64) -> Value {
    let credentials = client.credentials().credentials();
    json!({
        "apiUrl": client.base_url(),
        "loggedIn": credentials.access_token.is_some(),
        "hasRefreshToken": credentials.refresh_token.is_some(),
        "expiresAt": credentials.expires_at,
        "expired": credentials.is_expired(now),
    })
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::ClientConfig;
    use auth_storage::{CredentialStore, Credentials, MemoryStore};
    use axum::Json;
    use axum::routing::post;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_each_command() {
        assert!(matches!(Command::parse(&args(&["status"]), None), Ok(Command::Status)));
        assert!(matches!(Command::parse(&args(&["me"]), None), Ok(Command::Me)));
        assert!(matches!(Command::parse(&args(&["logout"]), None), Ok(Command::Logout)));
        assert!(matches!(
            Command::parse(&args(&["users", "3", "10"]), None),
            Ok(Command::Users { page: 3, count: 10 })
        ));
    }

    #[test]
    fn users_defaults_page_and_count() {
        assert!(matches!(
            Command::parse(&args(&["users"]), None),
            Ok(Command::Users {
                page: DEFAULT_PAGE,
                count: DEFAULT_PAGE_SIZE
            })
        ));
    }

    #[test]
    fn users_rejects_non_numeric_page() {
        let err = Command::parse(&args(&["users", "two"]), None).unwrap_err();
        assert!(err.contains("page"), "got: {err}");
    }

    #[test]
    fn login_password_falls_back_to_env() {
        let cmd = Command::parse(&args(&["login", "mike"]), Some("from-env".into())).unwrap();
        match cmd {
            Command::Login { username, password } => {
                assert_eq!(username, "mike");
                assert_eq!(password.expose(), "from-env");
            }
            other => panic!("expected login, got {other:?}"),
        }

        let cmd = Command::parse(&args(&["login", "mike", "argv"]), Some("env".into())).unwrap();
        let Command::Login { password, .. } = cmd else {
            panic!("expected login");
        };
        assert_eq!(password.expose(), "argv", "argument wins over API_PASSWORD");
    }

    #[test]
    fn login_without_any_password_is_rejected() {
        assert!(Command::parse(&args(&["login", "mike"]), None).is_err());
        assert!(Command::parse(&args(&["login"]), Some("pw".into())).is_err());
    }

    #[test]
    fn login_debug_hides_password() {
        let cmd = Command::parse(&args(&["login", "mike", "hunter2"]), None).unwrap();
        assert!(!format!("{cmd:?}").contains("hunter2"));
    }

    #[test]
    fn unknown_and_missing_commands_rejected() {
        assert!(Command::parse(&args(&["frobnicate"]), None).is_err());
        assert!(Command::parse(&[], None).is_err());
    }

    #[test]
    fn config_flag_is_split_from_command() {
        let (config, rest) =
            split_config_flag(&args(&["users", "--config", "/etc/app.toml", "2"]));
        assert_eq!(config.as_deref(), Some("/etc/app.toml"));
        assert_eq!(rest, args(&["users", "2"]));

        let (config, rest) = split_config_flag(&args(&["me"]));
        assert!(config.is_none());
        assert_eq!(rest, args(&["me"]));
    }

    fn client_with(url: &str, store: Arc<CredentialStore>) -> ApiClient {
        ApiClient::new(ClientConfig::new(url), store).unwrap()
    }

    #[test]
    fn status_reports_session_without_tokens() {
        let store = Arc::new(CredentialStore::with_logging(Arc::new(MemoryStore::new())));
        store.replace(Credentials::new("secret-at".into(), "secret-rt".into(), 100));
        let client = client_with("http://localhost:1", store);

        let value = status(&client, 200);
        assert_eq!(value["loggedIn"], true);
        assert_eq!(value["hasRefreshToken"], true);
        assert_eq!(value["expiresAt"], 100);
        assert_eq!(value["expired"], true);
        let printed = value.to_string();
        assert!(!printed.contains("secret-at"));
        assert!(!printed.contains("secret-rt"));
    }

    #[tokio::test]
    async fn login_then_logout_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/authorize",
            post(|| async {
                Json(serde_json::json!({
                    "accessToken": "at",
                    "tokenType": "bearer",
                    "expires": 1_800_000_000,
                    "refreshToken": "rt",
                }))
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = Arc::new(CredentialStore::with_logging(Arc::new(MemoryStore::new())));
        let client = client_with(&format!("http://{addr}"), store.clone());

        let login = Command::parse(&args(&["login", "mike", "demo"]), None).unwrap();
        let out = run(login, &client).await.unwrap();
        assert_eq!(out["loggedIn"], true);
        assert_eq!(out["expires"], 1_800_000_000);
        assert_eq!(store.access_token().as_deref(), Some("at"));

        let out = run(Command::Logout, &client).await.unwrap();
        assert_eq!(out["loggedIn"], false);
        assert!(store.credentials().is_empty());
    }
}
