//! sd-spi-disk - SPI Bus Controller
//!
//! Owns the SPI peripheral and the chip-select line and arbitrates access to
//! them. Every protocol exchange happens inside a bus acquisition: the mutex
//! is held, chip-select is asserted and no other caller can interleave bytes
//! on the wire until the guard is dropped.

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// Filler byte clocked out whenever we only care about the receive side.
pub const FILL_BYTE: u8 = 0xFF;

/// Number of fill bytes clocked with chip-select deasserted to push the card
/// into SPI mode (at least 74 clock cycles are required).
const INIT_CLOCK_BYTES: usize = 10;

/// Deselect pulse width in microseconds.
const DESELECT_PULSE_US: u8 = 2;

/// The errors the bus controller can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusError {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set the chip-select pin
    Gpio,
}

/// Bus speed switching. `embedded-hal` 0.2 has no trait for changing the
/// baud rate of a configured SPI peripheral, so the concrete HAL type (or a
/// small newtype around it) provides this on the side.
pub trait SpiSpeed {
    /// Change the SPI clock to approximately `hz`.
    fn set_speed(&mut self, hz: u32);
}

/// Clock frequencies used on the bus.
///
/// Cards must be initialized below 400 kHz; once the card is out of the
/// identification phase the bus is switched to the fast clock.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct BusConfig {
    /// Clock used during card reset and initialization.
    pub slow_hz: u32,
    /// Clock used for normal operation.
    pub fast_hz: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            slow_hz: 400_000,
            fast_hz: 12_500_000,
        }
    }
}

struct BusInner<SPI, CS, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    config: BusConfig,
    configured: bool,
}

/// Arbitrates access to one SPI peripheral plus chip-select pin.
///
/// All state lives behind a blocking mutex so that `acquire` serializes
/// callers even when they run in different execution contexts. The pin
/// multiplexing and SPI mode (8-bit frames, CPOL/CPHA 0/0, MSB first) are
/// assumed to be set up by the HAL before the peripheral is handed over;
/// [`configure`](BusController::configure) only takes care of the parts that
/// must not run twice.
pub struct BusController<SPI, CS, D>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
{
    inner: spin::Mutex<BusInner<SPI, CS, D>>,
}

impl<SPI, CS, D> BusController<SPI, CS, D>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
{
    /// Create a new bus controller from an SPI peripheral, a chip-select
    /// output and a microsecond delay.
    pub fn new(spi: SPI, cs: CS, delay: D, config: BusConfig) -> Self {
        BusController {
            inner: spin::Mutex::new(BusInner {
                spi,
                cs,
                delay,
                config,
                configured: false,
            }),
        }
    }

    /// One-time hardware setup: chip-select deasserted, slow clock selected.
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub fn configure(&self) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        if inner.configured {
            return Ok(());
        }
        inner.cs.set_high().map_err(|_| BusError::Gpio)?;
        let slow_hz = inner.config.slow_hz;
        inner.spi.set_speed(slow_hz);
        inner.configured = true;
        Ok(())
    }

    /// Switch to the initialization clock. No-op until configured.
    pub fn set_slow_clock(&self) {
        let mut inner = self.inner.lock();
        if inner.configured {
            let hz = inner.config.slow_hz;
            inner.spi.set_speed(hz);
        }
    }

    /// Switch to the full-speed clock. No-op until configured.
    pub fn set_fast_clock(&self) {
        let mut inner = self.inner.lock();
        if inner.configured {
            let hz = inner.config.fast_hz;
            inner.spi.set_speed(hz);
        }
    }

    /// Clock out the idle preamble with chip-select deasserted.
    ///
    /// The card watches for at least 74 high bits before it will accept SPI
    /// mode commands; we send 80.
    pub fn send_init_clocks(&self) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        inner.cs.set_high().map_err(|_| BusError::Gpio)?;
        for _ in 0..INIT_CLOCK_BYTES {
            inner.transfer_byte(FILL_BYTE)?;
        }
        Ok(())
    }

    /// Take exclusive hold of the bus for one protocol transaction.
    ///
    /// Blocks until the bus is free, asserts chip-select and clocks one fill
    /// byte. Dropping the returned guard deasserts chip-select, clocks a
    /// trailing fill byte and releases the bus.
    pub fn acquire(&self) -> Result<BusGuard<'_, SPI, CS, D>, BusError> {
        let mut inner = self.inner.lock();
        inner.select()?;
        Ok(BusGuard { inner })
    }
}

impl<SPI, CS, D> BusInner<SPI, CS, D>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
{
    fn select(&mut self) -> Result<(), BusError> {
        self.cs.set_low().map_err(|_| BusError::Gpio)?;
        self.transfer_byte(FILL_BYTE)?;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), BusError> {
        self.cs.set_high().map_err(|_| BusError::Gpio)?;
        self.transfer_byte(FILL_BYTE)?;
        Ok(())
    }

    fn transfer_byte(&mut self, out: u8) -> Result<u8, BusError> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_| BusError::Transport)
    }
}

/// An exclusive, chip-select-asserted hold on the bus.
///
/// SPI is full-duplex: every clocked byte moves data in both directions.
/// Half-duplex use is expressed by the `write_bytes`/`read_bytes` pair,
/// which discard one side while still clocking real bytes on the wire.
pub struct BusGuard<'bus, SPI, CS, D>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
{
    inner: spin::MutexGuard<'bus, BusInner<SPI, CS, D>>,
}

impl<'bus, SPI, CS, D> BusGuard<'bus, SPI, CS, D>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
{
    /// Full-duplex single-byte exchange.
    pub fn transfer_byte(&mut self, out: u8) -> Result<u8, BusError> {
        self.inner.transfer_byte(out)
    }

    /// Receive one byte by clocking out a fill byte.
    pub fn receive_byte(&mut self) -> Result<u8, BusError> {
        self.transfer_byte(FILL_BYTE)
    }

    /// Send `src`, discarding whatever comes back.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<(), BusError> {
        for &b in src {
            self.inner.transfer_byte(b)?;
        }
        Ok(())
    }

    /// Fill `dst` by clocking out fill bytes.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<(), BusError> {
        for b in dst.iter_mut() {
            *b = self.inner.transfer_byte(FILL_BYTE)?;
        }
        Ok(())
    }

    /// Briefly deassert and reassert chip-select without giving up the bus.
    ///
    /// Used between retries of a command exchange while the caller keeps its
    /// acquisition.
    pub fn pulse_deselect(&mut self) -> Result<(), BusError> {
        self.inner.cs.set_high().map_err(|_| BusError::Gpio)?;
        self.inner.delay.delay_us(DESELECT_PULSE_US);
        self.inner.cs.set_low().map_err(|_| BusError::Gpio)?;
        Ok(())
    }
}

impl<'bus, SPI, CS, D> Drop for BusGuard<'bus, SPI, CS, D>
where
    SPI: Transfer<u8> + SpiSpeed,
    CS: OutputPin,
    D: DelayUs<u8>,
{
    /// Release must be kept infallible, because Drop is unable to fail.
    /// See https://github.com/rust-lang/rfcs/issues/814
    fn drop(&mut self) {
        self.inner.deselect().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Wire {
        sent: Vec<u8>,
        cs_low: bool,
        cs_edges: u32,
        speed_hz: Vec<u32>,
    }

    #[derive(Clone)]
    struct TestSpi(Rc<RefCell<Wire>>);
    #[derive(Clone)]
    struct TestCs(Rc<RefCell<Wire>>);
    struct TestDelay;

    impl Transfer<u8> for TestSpi {
        type Error = ();
        fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
            let mut wire = self.0.borrow_mut();
            for w in words.iter_mut() {
                wire.sent.push(*w);
                *w = 0xFF;
            }
            Ok(words)
        }
    }

    impl SpiSpeed for TestSpi {
        fn set_speed(&mut self, hz: u32) {
            self.0.borrow_mut().speed_hz.push(hz);
        }
    }

    impl OutputPin for TestCs {
        type Error = ();
        fn set_low(&mut self) -> Result<(), ()> {
            let mut wire = self.0.borrow_mut();
            if !wire.cs_low {
                wire.cs_edges += 1;
            }
            wire.cs_low = true;
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), ()> {
            self.0.borrow_mut().cs_low = false;
            Ok(())
        }
    }

    impl DelayUs<u8> for TestDelay {
        fn delay_us(&mut self, _us: u8) {}
    }

    fn test_bus() -> (Rc<RefCell<Wire>>, BusController<TestSpi, TestCs, TestDelay>) {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let bus = BusController::new(
            TestSpi(wire.clone()),
            TestCs(wire.clone()),
            TestDelay,
            BusConfig::default(),
        );
        (wire, bus)
    }

    #[test]
    fn configure_is_idempotent() {
        let (wire, bus) = test_bus();
        bus.configure().unwrap();
        bus.configure().unwrap();
        assert_eq!(wire.borrow().speed_hz, vec![400_000]);
        assert!(!wire.borrow().cs_low);
    }

    #[test]
    fn clock_switching_is_a_noop_until_configured() {
        let (wire, bus) = test_bus();
        bus.set_fast_clock();
        assert!(wire.borrow().speed_hz.is_empty());
        bus.configure().unwrap();
        bus.set_fast_clock();
        bus.set_slow_clock();
        assert_eq!(wire.borrow().speed_hz, vec![400_000, 12_500_000, 400_000]);
    }

    #[test]
    fn init_clocks_sent_with_cs_deasserted() {
        let (wire, bus) = test_bus();
        bus.configure().unwrap();
        bus.send_init_clocks().unwrap();
        let wire = wire.borrow();
        assert!(!wire.cs_low);
        assert_eq!(wire.sent, vec![0xFF; 10]);
    }

    #[test]
    fn acquire_release_leaves_cs_deasserted_and_bus_free() {
        let (wire, bus) = test_bus();
        bus.configure().unwrap();
        {
            let mut guard = bus.acquire().unwrap();
            assert!(wire.borrow().cs_low);
            guard.write_bytes(&[1, 2, 3]).unwrap();
            let mut buf = [0u8; 2];
            guard.read_bytes(&mut buf).unwrap();
        }
        assert!(!wire.borrow().cs_low);
        // The mutex must be free again: a second acquisition succeeds.
        let _guard = bus.acquire().unwrap();
        assert!(wire.borrow().cs_low);
    }

    #[test]
    fn guard_brackets_traffic_with_fill_bytes() {
        let (wire, bus) = test_bus();
        bus.configure().unwrap();
        {
            let mut guard = bus.acquire().unwrap();
            guard.write_bytes(&[0x40]).unwrap();
        }
        assert_eq!(wire.borrow().sent, vec![0xFF, 0x40, 0xFF]);
    }

    #[test]
    fn pulse_deselect_reasserts_cs() {
        let (wire, bus) = test_bus();
        bus.configure().unwrap();
        let mut guard = bus.acquire().unwrap();
        let edges_before = wire.borrow().cs_edges;
        guard.pulse_deselect().unwrap();
        let wire = wire.borrow();
        assert!(wire.cs_low);
        assert_eq!(wire.cs_edges, edges_before + 1);
    }
}
