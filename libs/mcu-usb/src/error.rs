#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes than the structure needs; carries the number that arrived
    ShortPacket(usize),
    /// The destination buffer cannot hold the data
    BufferTooSmall,
    /// A transfer is already in flight on the endpoint
    Busy,
    /// The host has not selected a configuration yet
    NotConfigured,
}
