//! Line-oriented text protocol spoken by clients, the controller and storage nodes.
//!
//! Every message is a single line of space-separated tokens terminated by `\n`.
//! The first token is the message kind. Raw file content never travels inside a
//! [`Message`]: after an acknowledged `STORE` or `REBALANCE_STORE`, exactly
//! `size` raw bytes follow on the same stream and are pulled out of band with
//! [`Connection::request_bytes`](crate::network::Connection::request_bytes).

use crate::error::ProtocolError;
use crate::types::StorePort;
use std::fmt;
use std::str::FromStr;

/// A parsed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A storage node announces the port it serves on.
    Join { port: StorePort },
    /// Store request (client to controller, client to storage node).
    Store { name: String, size: u64 },
    /// Ports a client must upload a new file to.
    StoreTo { ports: Vec<StorePort> },
    /// A storage node persisted its replica of a file.
    StoreAck { name: String },
    /// Every replica of a stored file was acknowledged.
    StoreComplete,
    /// Client asks where to load a file from.
    Load { name: String },
    /// Port to fetch a file from, and its size.
    LoadFrom { port: StorePort, size: u64 },
    /// Client asks for another replica after a failed fetch.
    Reload { name: String },
    /// Client fetches file content from a storage node.
    LoadData { name: String },
    /// Remove request (client to controller, controller to storage node).
    Remove { name: String },
    /// A storage node deleted its replica of a file.
    RemoveAck { name: String },
    /// Every replica of a removed file was deleted.
    RemoveComplete,
    /// File listing. Empty when used as a request.
    List(Vec<String>),
    /// Rebalance instructions for one storage node.
    Rebalance {
        /// Files to push, each with the ports that should receive it.
        sends: Vec<(String, Vec<StorePort>)>,
        /// Files to delete once every push finished.
        removes: Vec<String>,
    },
    /// A peer is about to push a replica during a rebalance.
    RebalanceStore { name: String, size: u64 },
    /// A storage node applied its rebalance instructions.
    RebalanceComplete,
    /// Permission to start streaming raw bytes.
    Ack,
    ErrorFileAlreadyExists,
    ErrorFileDoesNotExist,
    ErrorNotEnoughDstores,
    ErrorLoad,
}

impl Message {
    /// Wire token of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "JOIN",
            Message::Store { .. } => "STORE",
            Message::StoreTo { .. } => "STORE_TO",
            Message::StoreAck { .. } => "STORE_ACK",
            Message::StoreComplete => "STORE_COMPLETE",
            Message::Load { .. } => "LOAD",
            Message::LoadFrom { .. } => "LOAD_FROM",
            Message::Reload { .. } => "RELOAD",
            Message::LoadData { .. } => "LOAD_DATA",
            Message::Remove { .. } => "REMOVE",
            Message::RemoveAck { .. } => "REMOVE_ACK",
            Message::RemoveComplete => "REMOVE_COMPLETE",
            Message::List(_) => "LIST",
            Message::Rebalance { .. } => "REBALANCE",
            Message::RebalanceStore { .. } => "REBALANCE_STORE",
            Message::RebalanceComplete => "REBALANCE_COMPLETE",
            Message::Ack => "ACK",
            Message::ErrorFileAlreadyExists => "ERROR_FILE_ALREADY_EXISTS",
            Message::ErrorFileDoesNotExist => "ERROR_FILE_DOES_NOT_EXIST",
            Message::ErrorNotEnoughDstores => "ERROR_NOT_ENOUGH_DSTORES",
            Message::ErrorLoad => "ERROR_LOAD",
        }
    }

    /// Parse one line, without its terminator.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = line.split_whitespace();
        let kind = tokens.next().ok_or(ProtocolError::Empty)?;
        let args: Vec<&str> = tokens.collect();

        let msg = match kind {
            "JOIN" => {
                let [port] = exact::<1>(&args, "JOIN")?;
                Message::Join {
                    port: number("JOIN", port)?,
                }
            }
            "STORE" => {
                let [name, size] = exact::<2>(&args, "STORE")?;
                Message::Store {
                    name: name.to_string(),
                    size: number("STORE", size)?,
                }
            }
            "STORE_TO" => Message::StoreTo {
                ports: args
                    .iter()
                    .map(|p| number("STORE_TO", p))
                    .collect::<Result<_, _>>()?,
            },
            "STORE_ACK" => {
                let [name] = exact::<1>(&args, "STORE_ACK")?;
                Message::StoreAck {
                    name: name.to_string(),
                }
            }
            "STORE_COMPLETE" => {
                exact::<0>(&args, "STORE_COMPLETE")?;
                Message::StoreComplete
            }
            "LOAD" => {
                let [name] = exact::<1>(&args, "LOAD")?;
                Message::Load {
                    name: name.to_string(),
                }
            }
            "LOAD_FROM" => {
                let [port, size] = exact::<2>(&args, "LOAD_FROM")?;
                Message::LoadFrom {
                    port: number("LOAD_FROM", port)?,
                    size: number("LOAD_FROM", size)?,
                }
            }
            "RELOAD" => {
                let [name] = exact::<1>(&args, "RELOAD")?;
                Message::Reload {
                    name: name.to_string(),
                }
            }
            "LOAD_DATA" => {
                let [name] = exact::<1>(&args, "LOAD_DATA")?;
                Message::LoadData {
                    name: name.to_string(),
                }
            }
            "REMOVE" => {
                let [name] = exact::<1>(&args, "REMOVE")?;
                Message::Remove {
                    name: name.to_string(),
                }
            }
            "REMOVE_ACK" => {
                let [name] = exact::<1>(&args, "REMOVE_ACK")?;
                Message::RemoveAck {
                    name: name.to_string(),
                }
            }
            "REMOVE_COMPLETE" => {
                exact::<0>(&args, "REMOVE_COMPLETE")?;
                Message::RemoveComplete
            }
            "LIST" => Message::List(args.iter().map(|s| s.to_string()).collect()),
            "REBALANCE" => parse_rebalance(&args)?,
            "REBALANCE_STORE" => {
                let [name, size] = exact::<2>(&args, "REBALANCE_STORE")?;
                Message::RebalanceStore {
                    name: name.to_string(),
                    size: number("REBALANCE_STORE", size)?,
                }
            }
            "REBALANCE_COMPLETE" => {
                exact::<0>(&args, "REBALANCE_COMPLETE")?;
                Message::RebalanceComplete
            }
            "ACK" => {
                exact::<0>(&args, "ACK")?;
                Message::Ack
            }
            "ERROR_FILE_ALREADY_EXISTS" => Message::ErrorFileAlreadyExists,
            "ERROR_FILE_DOES_NOT_EXIST" => Message::ErrorFileDoesNotExist,
            "ERROR_NOT_ENOUGH_DSTORES" => Message::ErrorNotEnoughDstores,
            "ERROR_LOAD" => Message::ErrorLoad,
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };

        Ok(msg)
    }
}

fn exact<'a, const N: usize>(
    args: &[&'a str],
    kind: &'static str,
) -> Result<[&'a str; N], ProtocolError> {
    <[&str; N]>::try_from(args).map_err(|_| ProtocolError::MalformedArguments { kind })
}

fn number<T: FromStr>(kind: &'static str, value: &str) -> Result<T, ProtocolError> {
    value.parse().map_err(|_| ProtocolError::InvalidNumber {
        kind,
        value: value.to_string(),
    })
}

fn parse_rebalance(args: &[&str]) -> Result<Message, ProtocolError> {
    const KIND: &str = "REBALANCE";
    let malformed = || ProtocolError::MalformedArguments { kind: KIND };
    let mut it = args.iter().copied();

    let send_count: usize = number(KIND, it.next().ok_or_else(malformed)?)?;
    let mut sends = Vec::with_capacity(send_count.min(args.len()));
    for _ in 0..send_count {
        let name = it.next().ok_or_else(malformed)?.to_string();
        let node_count: usize = number(KIND, it.next().ok_or_else(malformed)?)?;
        let mut ports = Vec::with_capacity(node_count.min(args.len()));
        for _ in 0..node_count {
            ports.push(number(KIND, it.next().ok_or_else(malformed)?)?);
        }
        sends.push((name, ports));
    }

    let remove_count: usize = number(KIND, it.next().ok_or_else(malformed)?)?;
    let removes: Vec<String> = it.by_ref().take(remove_count).map(str::to_string).collect();
    if removes.len() != remove_count || it.next().is_some() {
        return Err(malformed());
    }

    Ok(Message::Rebalance { sends, removes })
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())?;
        match self {
            Message::Join { port } => write!(f, " {port}"),
            Message::Store { name, size } | Message::RebalanceStore { name, size } => {
                write!(f, " {name} {size}")
            }
            Message::StoreTo { ports } => {
                for port in ports {
                    write!(f, " {port}")?;
                }
                Ok(())
            }
            Message::StoreAck { name }
            | Message::Load { name }
            | Message::Reload { name }
            | Message::LoadData { name }
            | Message::Remove { name }
            | Message::RemoveAck { name } => write!(f, " {name}"),
            Message::LoadFrom { port, size } => write!(f, " {port} {size}"),
            Message::List(names) => {
                for name in names {
                    write!(f, " {name}")?;
                }
                Ok(())
            }
            Message::Rebalance { sends, removes } => {
                write!(f, " {}", sends.len())?;
                for (name, ports) in sends {
                    write!(f, " {name} {}", ports.len())?;
                    for port in ports {
                        write!(f, " {port}")?;
                    }
                }
                write!(f, " {}", removes.len())?;
                for name in removes {
                    write!(f, " {name}")?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
