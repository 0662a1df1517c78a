//! Control commands and their JSON wire representation.
//!
//! A frame is `{"type":"command","command":<name>,"args":{...}}` as UTF-8 JSON
//! followed by a single [`END_OF_COMMAND`] byte. `0x00` never appears in
//! UTF-8 encoded JSON text, so it needs no escaping and no length prefix.

use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use thiserror::Error as ThisError;

/// Frame terminator.
pub const END_OF_COMMAND: u8 = 0x00;

/// Value of the `type` discriminator on every frame.
pub const COMMAND_TYPE: &str = "command";

/// Something a decoded command can act on. Implemented by the supervisor.
pub trait CommandTarget: Send + Sync {
    fn stop(&self) -> impl Future<Output = ()> + Send;
    fn restart(&self) -> impl Future<Output = ()> + Send;
}

/// A control request.
///
/// Constructing a command has no side effects; it only acts when
/// [`Command::execute`] is called with a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stop the supervised application and the supervisor.
    Stop,
    /// Stop the supervised application and start a fresh one.
    Restart,
}

/// A variant constructor rejected the arguments it was given.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    #[error("unexpected argument `{0}`")]
    Unexpected(String),
}

type Constructor = fn(&Map<String, Value>) -> std::result::Result<Command, ArgsError>;

/// Name to constructor table consulted by [`Command::parse`].
const REGISTRY: &[(&str, Constructor)] = &[
    ("StopCommand", stop_from_args),
    ("RestartCommand", restart_from_args),
];

fn stop_from_args(args: &Map<String, Value>) -> std::result::Result<Command, ArgsError> {
    no_args(args).map(|()| Command::Stop)
}

fn restart_from_args(args: &Map<String, Value>) -> std::result::Result<Command, ArgsError> {
    no_args(args).map(|()| Command::Restart)
}

fn no_args(args: &Map<String, Value>) -> std::result::Result<(), ArgsError> {
    match args.keys().next() {
        Some(key) => Err(ArgsError::Unexpected(key.clone())),
        None => Ok(()),
    }
}

fn lookup(name: &str) -> Option<Constructor> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, ctor)| *ctor)
}

impl Command {
    /// Registered names of every variant.
    pub fn registered_names() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(name, _)| *name)
    }

    /// Wire name of this variant.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Stop => "StopCommand",
            Command::Restart => "RestartCommand",
        }
    }

    /// Constructor arguments of this variant.
    pub fn args(&self) -> Map<String, Value> {
        match self {
            Command::Stop | Command::Restart => Map::new(),
        }
    }

    /// Build a command from its wire name and arguments.
    pub fn from_parts(name: &str, args: &Map<String, Value>) -> Result<Self> {
        let ctor = lookup(name)
            .ok_or_else(|| Error::protocol(format!("unknown command `{}`", name)))?;
        ctor(args).map_err(|e| Error::Protocol {
            reason: format!("invalid arguments for `{}`", name),
            source: Some(Box::new(e)),
        })
    }

    /// Encode as a JSON frame including the trailing terminator.
    pub fn serialize(&self) -> Vec<u8> {
        let doc = json!({
            "type": COMMAND_TYPE,
            "command": self.name(),
            "args": Value::Object(self.args()),
        });
        let mut bytes = doc.to_string().into_bytes();
        bytes.push(END_OF_COMMAND);
        bytes
    }

    /// Decode one frame body (without the terminator).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let doc: Value = serde_json::from_slice(bytes)?;
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::protocol("command frame is not a JSON object"))?;

        match obj.get("type").and_then(Value::as_str) {
            Some(COMMAND_TYPE) => {}
            other => {
                return Err(Error::protocol(format!(
                    "expected type `{}`, got {:?}",
                    COMMAND_TYPE, other
                )))
            }
        }

        let name = obj
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("missing `command` field"))?;

        let empty = Map::new();
        let args = match obj.get("args") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => return Err(Error::protocol("`args` must be a JSON object")),
        };

        Self::from_parts(name, args)
    }

    /// Apply this command to `target`.
    pub async fn execute<T: CommandTarget>(&self, target: &T) {
        match self {
            Command::Stop => target.stop().await,
            Command::Restart => target.restart().await,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn body(frame: &[u8]) -> &[u8] {
        assert_eq!(frame.last(), Some(&END_OF_COMMAND));
        &frame[..frame.len() - 1]
    }

    #[test]
    fn test_roundtrip_every_registered_variant() {
        for name in Command::registered_names() {
            let cmd = Command::from_parts(name, &Map::new()).unwrap();
            let parsed = Command::parse(body(&cmd.serialize())).unwrap();
            assert_eq!(parsed, cmd);
            assert_eq!(parsed.name(), name);
            assert!(parsed.args().is_empty());
        }
    }

    #[test]
    fn test_serialized_shape() {
        let frame = Command::Stop.serialize();
        let doc: Value = serde_json::from_slice(body(&frame)).unwrap();
        assert_eq!(doc["type"], "command");
        assert_eq!(doc["command"], "StopCommand");
        assert_eq!(doc["args"], json!({}));
        assert_eq!(frame.iter().filter(|b| **b == END_OF_COMMAND).count(), 1);
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let err = Command::parse(br#"{"type":"command","command":"DoesNotExist","args":{}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_wrong_type_is_protocol_error() {
        let err = Command::parse(br#"{"type":"event","command":"StopCommand"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        let err = Command::parse(br#"{"command":"StopCommand"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_missing_name_is_protocol_error() {
        let err = Command::parse(br#"{"type":"command","args":{}}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_invalid_json_is_decode_error() {
        let err = Command::parse(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let err = Command::parse(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_rejected_args_keep_cause() {
        let err = Command::parse(br#"{"type":"command","command":"StopCommand","args":{"now":true}}"#)
            .unwrap_err();
        match err {
            Error::Protocol { source, .. } => {
                let cause = source.expect("constructor error is attached");
                assert_eq!(cause.to_string(), "unexpected argument `now`");
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_args_defaults_to_empty() {
        let cmd = Command::parse(br#"{"type":"command","command":"RestartCommand"}"#).unwrap();
        assert_eq!(cmd, Command::Restart);
    }

    #[derive(Default)]
    struct CountingTarget {
        stops: AtomicUsize,
        restarts: AtomicUsize,
    }

    impl CommandTarget for CountingTarget {
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        async fn restart(&self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_execute_has_exactly_one_effect() {
        let target = CountingTarget::default();
        let cmd = Command::Restart;
        assert_eq!(target.restarts.load(Ordering::SeqCst), 0);

        cmd.execute(&target).await;
        assert_eq!(target.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(target.stops.load(Ordering::SeqCst), 0);

        Command::Stop.execute(&target).await;
        assert_eq!(target.stops.load(Ordering::SeqCst), 1);
        assert_eq!(target.restarts.load(Ordering::SeqCst), 1);
    }
}
