//! Plain-integer aliases for verbs identifiers.

/// [`u8`]: **Port number** of an HCA, counting from 1.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)** assigned to a port by the subnet manager.
pub type Lid = u16;

/// [`u8`]: **GID index** into the GID table of a port.
pub type GidIndex = u8;

/// [`u32`]: **Queue pair number**.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**.
pub type Psn = u32;

/// [`u32`]: **Queue key** checked on every datagram accepted by a UD QP.
pub type QKey = u32;

/// [`u32`]: **Local key** of a memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key** of a memory region, handed to peers for one-sided access.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, echoed back in the work completion.
pub type WrId = u64;

/// [`u8`]: **Service level** of a path.
pub type ServiceLevel = u8;
