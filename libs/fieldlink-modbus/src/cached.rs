//! Idle-expiry cached Modbus connection
//!
//! Keeps an expensive transport handle open across bursty request/response
//! transactions, serializes concurrent callers onto it, and closes it after a
//! configurable period of inactivity. A zero keep-open window disables
//! caching entirely: every transaction opens and closes a fresh handle.

use crate::pdu::{self, FunctionCode};
use crate::transport::ModbusTransport;
use errors::{FieldLinkError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default keep-open window
pub const DEFAULT_KEEP_OPEN: Duration = Duration::from_secs(90);

/// How long shutdown waits for the expiry task to stop
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Factory producing unconnected transports; invoked once per expiry cycle
pub type TransportFactory = Box<dyn Fn() -> Box<dyn ModbusTransport> + Send + Sync>;

struct Slot {
    transport: Option<Box<dyn ModbusTransport>>,
}

struct ExpiryTimer {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct Shared {
    description: String,
    keep_open: Duration,
    expiry: parking_lot::Mutex<Instant>,
    timer: parking_lot::Mutex<Option<ExpiryTimer>>,
}

impl Shared {
    /// Push the idle deadline forward by the keep-open window
    fn touch(&self) {
        if self.keep_open.is_zero() {
            return;
        }
        trace!(
            "extending connection {} expiry to {}s from now",
            self.description,
            self.keep_open.as_secs()
        );
        *self.expiry.lock() = Instant::now() + self.keep_open;
    }

    fn expired(&self) -> bool {
        *self.expiry.lock() <= Instant::now()
    }
}

/// A transport handle cached across transactions with idle expiry.
///
/// `acquire` grants exclusive use of the connection, opening it if needed.
/// After the keep-open window elapses with no activity, a background task
/// closes the handle so the next transaction opens a fresh one. The
/// connection transparently reopens on the next `acquire` after an expiry or
/// transport failure.
pub struct CachedModbusConnection {
    factory: TransportFactory,
    slot: Arc<Mutex<Slot>>,
    shared: Arc<Shared>,
}

impl CachedModbusConnection {
    /// Create a cache around `factory`-produced transports.
    ///
    /// A zero `keep_open` disables caching: every transaction opens and
    /// closes its own handle.
    pub fn new(description: impl Into<String>, keep_open: Duration, factory: TransportFactory) -> Self {
        let shared = Shared {
            description: description.into(),
            keep_open,
            expiry: parking_lot::Mutex::new(Instant::now() + keep_open),
            timer: parking_lot::Mutex::new(None),
        };
        Self {
            factory,
            slot: Arc::new(Mutex::new(Slot { transport: None })),
            shared: Arc::new(shared),
        }
    }

    /// Endpoint description this cache serves
    pub fn description(&self) -> &str {
        &self.shared.description
    }

    /// Acquire exclusive use of the connection, opening it if no live handle
    /// exists. Open failures propagate and leave the entry clear so the next
    /// call attempts a fresh open.
    pub async fn acquire(&self) -> Result<ConnectionGuard<'_>> {
        let mut slot = self.slot.lock().await;
        if slot.transport.is_none() {
            let mut transport = (self.factory)();
            transport.connect().await?;
            info!(
                "opened Modbus connection {}; keep for {}s",
                self.shared.description,
                self.shared.keep_open.as_secs()
            );
            slot.transport = Some(transport);
            self.shared.touch();
            self.ensure_timer();
        }
        Ok(ConnectionGuard {
            slot,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Unconditionally close the transport and stop the expiry task.
    /// Idempotent; used for shutdown and reconfiguration.
    pub async fn force_close(&self) {
        let timer = self.shared.timer.lock().take();
        if let Some(timer) = timer {
            timer.cancel.cancel();
            if timeout(SHUTDOWN_WAIT, timer.handle).await.is_err() {
                warn!(
                    "expiry task for {} did not stop within {:?}",
                    self.shared.description, SHUTDOWN_WAIT
                );
            }
        }
        let mut slot = self.slot.lock().await;
        if let Some(mut transport) = slot.transport.take() {
            let _ = transport.close().await;
            info!("closed Modbus connection {}", self.shared.description);
        }
    }

    /// Start the expiry task if none exists or the previous one has finished
    fn ensure_timer(&self) {
        if self.shared.keep_open.is_zero() {
            return;
        }
        let mut timer = self.shared.timer.lock();
        let needs_start = timer.as_ref().map_or(true, |t| t.handle.is_finished());
        if needs_start {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(expiry_loop(
                Arc::clone(&self.slot),
                Arc::clone(&self.shared),
                cancel.clone(),
            ));
            *timer = Some(ExpiryTimer { handle, cancel });
        }
    }
}

impl Drop for CachedModbusConnection {
    fn drop(&mut self) {
        // the expiry task must not outlive its cache entry
        if let Some(timer) = self.shared.timer.lock().take() {
            timer.cancel.cancel();
        }
    }
}

/// Sleeps until the idle deadline, chasing it as activity pushes it forward;
/// closes the handle and exits once the deadline passes unmoved.
async fn expiry_loop(slot: Arc<Mutex<Slot>>, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let deadline = *shared.expiry.lock();
        let now = Instant::now();
        if deadline <= now {
            let mut slot = slot.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            // the deadline may have moved while waiting for the lock
            if *shared.expiry.lock() > Instant::now() {
                continue;
            }
            if let Some(mut transport) = slot.transport.take() {
                let _ = transport.close().await;
                info!("closed idle Modbus connection {}", shared.description);
            }
            return;
        }
        debug!(
            "connection {} expires in {:?}",
            shared.description,
            deadline - now
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline.into()) => {},
        }
    }
}

/// Exclusive use of the cached connection for one transaction.
///
/// Every successful exchange counts as activity and pushes the idle deadline
/// forward. A transport failure closes the handle immediately so the next
/// transaction reopens instead of reusing a socket in an unknown state.
pub struct ConnectionGuard<'a> {
    slot: MutexGuard<'a, Slot>,
    shared: Arc<Shared>,
}

impl ConnectionGuard<'_> {
    async fn exchange(&mut self, unit_id: u8, request: &[u8]) -> Result<Vec<u8>> {
        let transport = self
            .slot
            .transport
            .as_mut()
            .ok_or(FieldLinkError::NotConnected)?;
        match transport.execute(unit_id, request).await {
            Ok(response) => {
                self.shared.touch();
                Ok(response)
            },
            Err(err) => {
                if let Some(mut transport) = self.slot.transport.take() {
                    let _ = transport.close().await;
                }
                warn!(
                    "transport failure on {}: {err}; connection closed",
                    self.shared.description
                );
                Err(err)
            },
        }
    }

    /// Whether a live handle is still present (it is taken on failure)
    pub fn is_open(&self) -> bool {
        self.slot.transport.is_some()
    }

    pub async fn read_coils(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        let request = pdu::read_request(FunctionCode::ReadCoils, address, count)?;
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_bit_response(FunctionCode::ReadCoils, &response, count)
    }

    pub async fn read_discrete_inputs(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>> {
        let request = pdu::read_request(FunctionCode::ReadDiscreteInputs, address, count)?;
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_bit_response(FunctionCode::ReadDiscreteInputs, &response, count)
    }

    pub async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = pdu::read_request(FunctionCode::ReadHoldingRegisters, address, count)?;
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_word_response(FunctionCode::ReadHoldingRegisters, &response, count)
    }

    pub async fn read_input_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = pdu::read_request(FunctionCode::ReadInputRegisters, address, count)?;
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_word_response(FunctionCode::ReadInputRegisters, &response, count)
    }

    pub async fn write_coil(&mut self, unit_id: u8, address: u16, value: bool) -> Result<()> {
        let request = pdu::write_coil_request(address, value);
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_write_response(FunctionCode::WriteSingleCoil, &response)
    }

    pub async fn write_coils(&mut self, unit_id: u8, address: u16, values: &[bool]) -> Result<()> {
        let request = pdu::write_coils_request(address, values)?;
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_write_response(FunctionCode::WriteMultipleCoils, &response)
    }

    pub async fn write_register(&mut self, unit_id: u8, address: u16, value: u16) -> Result<()> {
        let request = pdu::write_register_request(address, value);
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_write_response(FunctionCode::WriteSingleRegister, &response)
    }

    pub async fn write_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let request = pdu::write_registers_request(address, values)?;
        let response = self.exchange(unit_id, &request).await?;
        pdu::parse_write_response(FunctionCode::WriteMultipleRegisters, &response)
    }

    /// Release exclusive use. Closes the transport only if caching is
    /// disabled or the idle deadline already elapsed while this transaction
    /// held the connection.
    pub async fn release(mut self) {
        if self.shared.keep_open.is_zero() || self.shared.expired() {
            if let Some(mut transport) = self.slot.transport.take() {
                let _ = transport.close().await;
                debug!(
                    "closed Modbus connection {} on release",
                    self.shared.description
                );
            }
        }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        // release() is the graceful path; dropping still closes the handle
        // when caching is disabled or the deadline already passed
        if self.shared.keep_open.is_zero() || self.shared.expired() {
            drop(self.slot.transport.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Span markers recorded by the mock so tests can check interleaving
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Span {
        Begin(u8),
        End(u8),
    }

    #[derive(Default)]
    struct MockState {
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail_connect: AtomicBool,
        fail_execute: AtomicBool,
        spans: parking_lot::Mutex<Vec<Span>>,
    }

    #[derive(Debug)]
    struct MockTransport {
        state: Arc<MockState>,
        connected: bool,
    }

    impl MockTransport {
        fn factory(state: &Arc<MockState>) -> TransportFactory {
            let state = Arc::clone(state);
            Box::new(move || {
                Box::new(MockTransport {
                    state: Arc::clone(&state),
                    connected: false,
                }) as Box<dyn ModbusTransport>
            })
        }
    }

    impl std::fmt::Debug for MockState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockState").finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl ModbusTransport for MockTransport {
        fn description(&self) -> String {
            "mock".to_string()
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn connect(&mut self) -> Result<()> {
            if self.state.fail_connect.load(Ordering::SeqCst) {
                return Err(FieldLinkError::connection_failed("mock", "refused"));
            }
            self.state.opens.fetch_add(1, Ordering::SeqCst);
            self.connected = true;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            if self.connected {
                self.state.closes.fetch_add(1, Ordering::SeqCst);
                self.connected = false;
            }
            Ok(())
        }

        async fn execute(&mut self, unit_id: u8, request: &[u8]) -> Result<Vec<u8>> {
            if self.state.fail_execute.load(Ordering::SeqCst) {
                return Err(FieldLinkError::Io("broken pipe".to_string()));
            }
            self.state.spans.lock().push(Span::Begin(unit_id));
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.state.spans.lock().push(Span::End(unit_id));
            // echo a single holding register equal to the request address
            let address = u16::from_be_bytes([request[1], request[2]]);
            Ok(vec![0x03, 0x02, (address >> 8) as u8, address as u8])
        }
    }

    async fn read_once(cache: &CachedModbusConnection, unit_id: u8) -> Result<Vec<u16>> {
        let mut conn = cache.acquire().await?;
        let result = conn.read_holding_registers(unit_id, 0x0010, 1).await;
        conn.release().await;
        result
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sequential_transactions_share_one_open() {
        let state = Arc::new(MockState::default());
        let cache = CachedModbusConnection::new(
            "mock",
            Duration::from_millis(400),
            MockTransport::factory(&state),
        );

        for _ in 0..3 {
            let words = read_once(&cache, 1).await.expect("read should succeed");
            assert_eq!(words, vec![0x0010]);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);
        assert_eq!(state.closes.load(Ordering::SeqCst), 0);

        cache.force_close().await;
        assert_eq!(state.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_gap_triggers_exactly_one_reopen() {
        let state = Arc::new(MockState::default());
        let cache = CachedModbusConnection::new(
            "mock",
            Duration::from_millis(150),
            MockTransport::factory(&state),
        );

        read_once(&cache, 1).await.expect("first read");
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);

        // wait well past the window so the expiry task closes the handle
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(state.closes.load(Ordering::SeqCst), 1);

        read_once(&cache, 1).await.expect("read after expiry");
        assert_eq!(state.opens.load(Ordering::SeqCst), 2);

        cache.force_close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn activity_pushes_deadline_forward() {
        let state = Arc::new(MockState::default());
        let cache = CachedModbusConnection::new(
            "mock",
            Duration::from_millis(300),
            MockTransport::factory(&state),
        );

        // transactions spaced closer than the window keep the handle alive
        for _ in 0..4 {
            read_once(&cache, 1).await.expect("read");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);
        assert_eq!(state.closes.load(Ordering::SeqCst), 0);

        cache.force_close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_window_disables_caching() {
        let state = Arc::new(MockState::default());
        let cache =
            CachedModbusConnection::new("mock", Duration::ZERO, MockTransport::factory(&state));

        for _ in 0..3 {
            read_once(&cache, 1).await.expect("read");
        }
        assert_eq!(state.opens.load(Ordering::SeqCst), 3);
        assert_eq!(state.closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_transactions_never_interleave() {
        let state = Arc::new(MockState::default());
        let cache = Arc::new(CachedModbusConnection::new(
            "mock",
            Duration::from_secs(5),
            MockTransport::factory(&state),
        ));

        let mut tasks = Vec::new();
        for unit in 1..=4u8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                read_once(&cache, unit).await.expect("read");
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        let spans = state.spans.lock().clone();
        assert_eq!(spans.len(), 8);
        for pair in spans.chunks_exact(2) {
            match (pair[0], pair[1]) {
                (Span::Begin(a), Span::End(b)) => assert_eq!(a, b),
                other => panic!("interleaved spans: {other:?}"),
            }
        }
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);

        cache.force_close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_failure_leaves_entry_clear() {
        let state = Arc::new(MockState::default());
        let cache = CachedModbusConnection::new(
            "mock",
            Duration::from_secs(5),
            MockTransport::factory(&state),
        );

        state.fail_connect.store(true, Ordering::SeqCst);
        assert!(read_once(&cache, 1).await.is_err());

        state.fail_connect.store(false, Ordering::SeqCst);
        read_once(&cache, 1).await.expect("read after recovery");
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);

        cache.force_close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn transport_failure_forces_reopen() {
        let state = Arc::new(MockState::default());
        let cache = CachedModbusConnection::new(
            "mock",
            Duration::from_secs(5),
            MockTransport::factory(&state),
        );

        read_once(&cache, 1).await.expect("first read");
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);

        state.fail_execute.store(true, Ordering::SeqCst);
        {
            let mut conn = cache.acquire().await.expect("acquire");
            let err = conn
                .read_holding_registers(1, 0, 1)
                .await
                .expect_err("transport failure");
            assert!(err.is_transport());
            assert!(!conn.is_open());
            conn.release().await;
        }

        state.fail_execute.store(false, Ordering::SeqCst);
        read_once(&cache, 1).await.expect("read after failure");
        assert_eq!(state.opens.load(Ordering::SeqCst), 2);
        assert!(logs_contain("transport failure"));

        cache.force_close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn force_close_is_idempotent() {
        let state = Arc::new(MockState::default());
        let cache = CachedModbusConnection::new(
            "mock",
            Duration::from_secs(5),
            MockTransport::factory(&state),
        );

        read_once(&cache, 1).await.expect("read");
        cache.force_close().await;
        cache.force_close().await;
        assert_eq!(state.closes.load(Ordering::SeqCst), 1);

        // the cache reopens transparently after a forced close
        read_once(&cache, 1).await.expect("read after close");
        assert_eq!(state.opens.load(Ordering::SeqCst), 2);

        cache.force_close().await;
    }
}
