//! Command tags carried in the first two bytes of every frame.
//!
//! | Command              | Tag     | Direction        | Payload                         |
//! |----------------------|---------|------------------|---------------------------------|
//! | `ConnectSocket`      | `01 01` | device → host    | session id (2)                  |
//! | `ConnectionResponse` | `01 02` | host → device    | session id (2) + success (2)    |
//! | `DisconnectSocket`   | `02 01` | both             | session id (2)                  |
//! | `DataPacket`         | `03 01` | both             | session id (2) + bytes          |
//! | `AccessoryConnected` | `04 01` | device → host    | forward port (4, big-endian)    |
//! | `CloseAccessory`     | `05 0F` | both             | empty                           |
//!
//! The tag `00 00` is reserved as "no command" and is never valid on the wire.

use std::fmt;

/// Every command the tunnel understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ConnectSocket,
    ConnectionResponse,
    DisconnectSocket,
    DataPacket,
    AccessoryConnected,
    CloseAccessory,
}

impl Command {
    /// All commands, in tag order.
    pub const ALL: [Command; 6] = [
        Command::ConnectSocket,
        Command::ConnectionResponse,
        Command::DisconnectSocket,
        Command::DataPacket,
        Command::AccessoryConnected,
        Command::CloseAccessory,
    ];

    /// Returns the fixed 2-byte wire tag for this command.
    pub const fn tag(self) -> [u8; 2] {
        match self {
            Command::ConnectSocket => [0x01, 0x01],
            Command::ConnectionResponse => [0x01, 0x02],
            Command::DisconnectSocket => [0x02, 0x01],
            Command::DataPacket => [0x03, 0x01],
            Command::AccessoryConnected => [0x04, 0x01],
            Command::CloseAccessory => [0x05, 0x0F],
        }
    }

    /// Looks up the command for a wire tag, returning `None` for unknown tags.
    pub fn from_tag(tag: [u8; 2]) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.tag() == tag)
    }
}

impl TryFrom<[u8; 2]> for Command {
    type Error = [u8; 2];

    fn try_from(tag: [u8; 2]) -> Result<Self, Self::Error> {
        Command::from_tag(tag).ok_or(tag)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::ConnectSocket => "CONNECT_SOCKET",
            Command::ConnectionResponse => "CONNECTION_RESP",
            Command::DisconnectSocket => "DISCONNECT_SOCKET",
            Command::DataPacket => "DATA_PACKET",
            Command::AccessoryConnected => "ACCESSORY_CONNECTED",
            Command::CloseAccessory => "CLOSE_ACCESSORY",
        };
        f.write_str(name)
    }
}
