/// Types implementing WireSerialisable can be written back to a client over
/// the spooler's line protocol.
pub trait WireSerialisable {
    /// Converts the value in question to its on-the-wire bytes, including any
    /// trailing CRLF.
    fn serialise_wire(&self) -> Vec<u8>;
}
