//! Line-oriented command console used by the `gatekeeper` binary.
//!
//! Each line on stdin drives the gateway the way a coordinator would:
//! clients register and leave, and send messages that are admitted, queued
//! or rejected.

use std::fmt;

use crate::gateway::{Admission, AdmissionGateway, ClientId};

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `register <client> <principal>`
    Register { client: ClientId, principal: String },
    /// `remove <client>`
    Remove { client: ClientId },
    /// `send <client> <text...>`
    Send { client: ClientId, text: String },
    /// `metrics`
    Metrics,
}

/// Why a console line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

impl Command {
    /// Parse one input line. Blank lines and `#` comments yield `None`.
    pub fn parse(line: &str) -> Option<Result<Command, ParseError>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut words = line.splitn(3, char::is_whitespace);
        let verb = words.next().unwrap_or_default();
        let first = words.next().map(str::trim).filter(|w| !w.is_empty());
        let rest = words.next().map(str::trim).filter(|w| !w.is_empty());

        let command = match (verb, first, rest) {
            ("register", Some(client), Some(principal)) if !principal.contains(char::is_whitespace) => {
                Ok(Command::Register {
                    client: ClientId::from(client),
                    principal: principal.to_string(),
                })
            }
            ("remove", Some(client), None) => Ok(Command::Remove {
                client: ClientId::from(client),
            }),
            ("send", Some(client), text) => Ok(Command::Send {
                client: ClientId::from(client),
                text: text.unwrap_or_default().to_string(),
            }),
            ("metrics", None, None) => Ok(Command::Metrics),
            _ => Err(ParseError(format!("unrecognized command: {}", line))),
        };
        Some(command)
    }

    /// Apply the command to the gateway and describe the result.
    pub fn execute(self, gateway: &AdmissionGateway<String>) -> String {
        match self {
            Command::Register { client, principal } => {
                gateway.on_client_registered(client.clone(), &principal);
                format!("registered {} as {}", client, principal)
            }
            Command::Remove { client } => {
                if gateway.on_client_removed(&client) {
                    format!("removed {}", client)
                } else {
                    format!("unknown client {}", client)
                }
            }
            Command::Send { client, text } => match gateway.admit(&client, text) {
                Admission::Admitted => format!("admitted message from {}", client),
                Admission::Queued(id) => format!("queued message {} from {}", id, client),
                Admission::Rejected(error) => format!("error to {}: {}", client, error),
            },
            Command::Metrics => {
                serde_json::to_string_pretty(&gateway.metrics_json()).unwrap_or_default()
            }
        }
    }
}
