//! Trait seam standing in for a buffered UART peripheral, the way the
//! teacher crate's generics are bounded by `SpiBus`/`OutputPin` rather than
//! talking to a concrete register block. Used for both the GNSS receiver's
//! UART and the host BLE-UART transport.

/// Non-blocking byte sink, awaited at a suspension point per spec.md 5.
pub trait UartTx {
    type Error;
    async fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;
}

/// Non-blocking byte source, awaited at a suspension point per spec.md 5.
pub trait UartRx {
    type Error;
    /// Read at least one byte into `buf`, returning the number read.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}
