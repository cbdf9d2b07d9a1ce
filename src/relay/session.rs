//! Audio relay session
//!
//! One session per connected sink: owns the sink's transport audio
//! output link, a capture session, and a fixed pool of recycled
//! buffers, and runs an event-driven worker that pulls released capture
//! buffers, shapes them against the system volume, forwards them to the
//! sink, and re-queues them.
//!
//! Initialization acquires resources in a fixed order (transport link,
//! capture session, buffer pool, worker) and any failure releases the
//! resources already acquired in strict reverse order. Teardown always
//! runs the same reverse order to completion.

use crate::address::DeviceAddress;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::relay::buffer_pool::BufferPool;
use crate::services::capture::{CaptureSession, ReleasedBuffer, SharedCapture};
use crate::services::sysaudio::SharedSystemAudio;
use crate::services::transport::{AudioOutHandle, AudioOutState, PcmParams, SharedTransport};
use crate::volume;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One sink's relay session.
///
/// Created by the reconciler when the transport reports a new connected
/// address; destroyed when the address disappears or a global suspend
/// tears every session down.
pub struct RelaySession {
    addr: DeviceAddress,
    stop_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl RelaySession {
    /// Initialize a session for `addr` and start its worker.
    ///
    /// On any failure every previously acquired resource is released in
    /// reverse order and the error is returned; the caller does not
    /// retain the session.
    pub async fn connect(
        addr: DeviceAddress,
        transport: SharedTransport,
        capture: SharedCapture,
        sysaudio: SharedSystemAudio,
        config: RelayConfig,
    ) -> Result<RelaySession> {
        // (a) transport audio-output link, under the shared transport lock
        let (link, state_rx) = TransportLink::open(&transport, addr, &config).await?;

        // (b) capture session at the fixed sample rate
        let (capture_session, release_rx) = match open_capture(&capture, config.sample_rate).await
        {
            Ok(opened) => opened,
            Err(e) => {
                link.close(&transport, addr).await;
                return Err(e);
            }
        };

        // (c) fixed buffer pool
        let pool = match BufferPool::new(config.num_buffers, config.samples_per_buffer) {
            Ok(pool) => pool,
            Err(e) => {
                close_capture(capture_session);
                link.close(&transport, addr).await;
                return Err(e);
            }
        };

        // (d) the worker that owns everything from here on
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            addr,
            transport,
            capture,
            sysaudio,
            config,
            link,
            capture_session,
            pool,
        };
        let worker = tokio::spawn(worker.run(stop_rx, state_rx, release_rx));

        info!("relay session for {addr} running");
        Ok(RelaySession {
            addr,
            stop_tx,
            worker,
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.addr
    }

    /// Stop the worker and wait for its finalization to complete.
    ///
    /// Stopping is cooperative: the worker observes the signal at its
    /// wait point and runs reverse-order teardown before exiting.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.worker.await {
            warn!("relay worker for {} did not exit cleanly: {e}", self.addr);
        }
    }
}

/// Open transport audio-output connection for one sink
struct TransportLink {
    handle: AudioOutHandle,
    state: AudioOutState,
}

impl TransportLink {
    async fn open(
        transport: &SharedTransport,
        addr: DeviceAddress,
        config: &RelayConfig,
    ) -> Result<(TransportLink, mpsc::UnboundedReceiver<()>)> {
        let mut t = transport.lock().await;

        let handle = t.open_audio_out(addr)?;

        let state_rx = match t.subscribe_output_state(handle) {
            Ok(rx) => rx,
            Err(e) => {
                t.close_audio_out(handle);
                return Err(e);
            }
        };

        let state = match t.audio_out_state(handle) {
            Ok(state) => state,
            Err(e) => {
                t.close_audio_out(handle);
                return Err(e);
            }
        };

        let params = PcmParams::pcm16(config.sample_rate);
        match t.start_audio_out(handle, params, config.target_latency()) {
            Ok(granted) => debug!("audio out for {addr} started, latency {granted:?}"),
            Err(e) if e.is_already_started() => debug!("audio out for {addr} already started"),
            Err(e) => {
                t.close_audio_out(handle);
                return Err(e);
            }
        }

        Ok((TransportLink { handle, state }, state_rx))
    }

    /// Stop output, close the connection, then release the pairing-level
    /// audio connection for the address.
    async fn close(self, transport: &SharedTransport, addr: DeviceAddress) {
        let mut t = transport.lock().await;
        t.stop_audio_out(self.handle);
        t.close_audio_out(self.handle);
        if let Err(e) = t.close_audio_connection(addr) {
            debug!("closing audio connection to {addr}: {e}");
        }
    }
}

async fn open_capture(
    capture: &SharedCapture,
    sample_rate: u32,
) -> Result<(Box<dyn CaptureSession>, mpsc::UnboundedReceiver<()>)> {
    let mut service = capture.lock().await;
    let mut session = service.open(sample_rate)?;

    if let Err(e) = session.start() {
        session.stop();
        return Err(e);
    }

    let release_rx = session.subscribe_released();
    Ok((session, release_rx))
}

fn close_capture(mut session: Box<dyn CaptureSession>) {
    session.stop();
}

/// Worker-owned session state; lives on the spawned task
struct Worker {
    addr: DeviceAddress,
    transport: SharedTransport,
    capture: SharedCapture,
    sysaudio: SharedSystemAudio,
    config: RelayConfig,
    link: TransportLink,
    capture_session: Box<dyn CaptureSession>,
    pool: BufferPool,
}

impl Worker {
    async fn run(
        mut self,
        mut stop_rx: watch::Receiver<bool>,
        mut state_rx: mpsc::UnboundedReceiver<()>,
        mut release_rx: mpsc::UnboundedReceiver<()>,
    ) {
        if let Err(e) = self.submit_all() {
            error!("initial buffer submit for {} failed: {e}", self.addr);
        }

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                event = state_rx.recv() => match event {
                    Some(()) => self.refresh_output_state().await,
                    None => {
                        // An initialized event source is assumed valid for
                        // the lifetime of the session.
                        error!("output-state events for {} ended unexpectedly", self.addr);
                        break;
                    }
                },
                event = release_rx.recv() => match event {
                    Some(()) => {
                        if let Err(e) = self.relay_released(&mut release_rx).await {
                            warn!("relaying for {} failed: {e}", self.addr);
                        }
                    }
                    None => {
                        error!("buffer-release events for {} ended unexpectedly", self.addr);
                        break;
                    }
                },
            }
        }

        self.finalize().await;
    }

    /// Queue every parked slot to the capture session
    fn submit_all(&mut self) -> Result<()> {
        for buffer in self.pool.take_all() {
            self.capture_session.submit(buffer)?;
        }
        Ok(())
    }

    /// Re-read and cache the transport output state. Exposed for
    /// observability; no further action at this layer.
    async fn refresh_output_state(&mut self) {
        let mut t = self.transport.lock().await;
        match t.audio_out_state(self.link.handle) {
            Ok(state) => {
                debug!("output state for {} is now {state:?}", self.addr);
                self.link.state = state;
            }
            Err(e) => warn!("reading output state for {}: {e}", self.addr),
        }
    }

    /// Drain released capture buffers: shape, send, re-queue each; then
    /// recover from desync if the newest release is stale.
    async fn relay_released(
        &mut self,
        release_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<()> {
        let released = self.capture_session.poll_released(self.config.num_buffers)?;
        let mut newest: Option<Instant> = None;

        for ReleasedBuffer {
            mut buffer,
            released_at,
        } in released
        {
            newest = Some(newest.map_or(released_at, |n| n.max(released_at)));

            // Best effort: an unreadable volume level forwards the block
            // unshaped rather than dropping it.
            if let Err(e) = volume::shape(&mut buffer.pcm, self.sysaudio.as_ref()) {
                warn!("volume read for {} failed, forwarding unshaped: {e}", self.addr);
            }

            {
                let mut t = self.transport.lock().await;
                if let Err(e) = t.send_audio(self.link.handle, &buffer.pcm) {
                    warn!("send to {} failed: {e}", self.addr);
                }
            }

            self.capture_session.submit(buffer)?;
        }

        // A release far past its nominal period means the relay lost
        // scheduling priority (e.g. an interactive application took over
        // capture) and the recorder must be reopened from scratch.
        if let Some(newest) = newest {
            if newest.elapsed() > self.config.desync_threshold() {
                info!("capture for {} desynchronized, reopening", self.addr);
                self.reopen_capture(release_rx).await?;
            }
        }

        Ok(())
    }

    /// Tear down and reopen the capture session, then re-queue all slots
    async fn reopen_capture(
        &mut self,
        release_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<()> {
        self.capture_session.stop();
        for buffer in self.capture_session.reclaim() {
            self.pool.put(buffer)?;
        }

        let (session, rx) = open_capture(&self.capture, self.config.sample_rate).await?;
        self.capture_session = session;
        *release_rx = rx;

        self.submit_all()
    }

    /// Reverse-order finalization: capture stopped and slots reclaimed,
    /// buffer pool released, capture session released, transport link
    /// released last.
    async fn finalize(mut self) {
        self.capture_session.stop();
        for buffer in self.capture_session.reclaim() {
            if let Err(e) = self.pool.put(buffer) {
                warn!("reclaiming slot for {}: {e}", self.addr);
            }
        }

        drop(self.pool);
        drop(self.capture_session);
        self.link.close(&self.transport, self.addr).await;

        info!("relay session for {} closed", self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sim::{SimCapture, SimSystemAudio, SimTransport};
    use crate::services::{capture, transport};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_addr() -> DeviceAddress {
        DeviceAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
    }

    fn small_config() -> RelayConfig {
        RelayConfig {
            num_buffers: 4,
            samples_per_buffer: 64,
            ..RelayConfig::default()
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_connect_submits_all_slots() {
        let transport_ctl = SimTransport::new();
        let capture_ctl = SimCapture::manual(440.0);
        let sysaudio = SimSystemAudio::new(15);

        let session = RelaySession::connect(
            test_addr(),
            transport::shared(transport_ctl.clone()),
            capture::shared(capture_ctl.clone()),
            Arc::new(sysaudio),
            small_config(),
        )
        .await
        .unwrap();

        wait_for(|| capture_ctl.pending_slots().len() == 4).await;
        assert_eq!(transport_ctl.open_count(), 1);

        session.shutdown().await;
        assert_eq!(transport_ctl.close_count(), 1);
        assert_eq!(transport_ctl.audio_connection_closes(), vec![test_addr()]);
    }

    #[tokio::test]
    async fn test_released_buffers_are_shaped_sent_and_requeued() {
        let transport_ctl = SimTransport::new();
        let capture_ctl = SimCapture::manual(440.0);
        let sysaudio = SimSystemAudio::new(15);
        let config = small_config();

        let session = RelaySession::connect(
            test_addr(),
            transport::shared(transport_ctl.clone()),
            capture::shared(capture_ctl.clone()),
            Arc::new(sysaudio),
            config.clone(),
        )
        .await
        .unwrap();

        wait_for(|| capture_ctl.pending_slots().len() == 4).await;
        capture_ctl.release_all(Duration::ZERO);

        wait_for(|| transport_ctl.sent_block_count() == 4).await;
        // Bytes transferred match the block size
        assert_eq!(
            transport_ctl.bytes_sent(),
            4 * config.samples_per_buffer * 2
        );
        // Every slot went back to the recorder for reuse
        wait_for(|| capture_ctl.pending_slots().len() == 4).await;
        assert_eq!(capture_ctl.session_count(), 1);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_volume_read_failure_forwards_unshaped() {
        let transport_ctl = SimTransport::new();
        let capture_ctl = SimCapture::manual(440.0);
        let sysaudio = SimSystemAudio::new(15);
        sysaudio.set_fail_reads(true);

        let session = RelaySession::connect(
            test_addr(),
            transport::shared(transport_ctl.clone()),
            capture::shared(capture_ctl.clone()),
            Arc::new(sysaudio),
            small_config(),
        )
        .await
        .unwrap();

        wait_for(|| capture_ctl.pending_slots().len() == 4).await;
        capture_ctl.release_all(Duration::ZERO);

        // Blocks still reach the sink, at full amplitude
        wait_for(|| transport_ctl.sent_block_count() == 4).await;
        let block = transport_ctl.last_sent_block();
        assert!(block.iter().any(|&s| s.unsigned_abs() > 20_000));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_release_reopens_capture_and_requeues_all_slots() {
        let transport_ctl = SimTransport::new();
        let capture_ctl = SimCapture::manual(440.0);
        let sysaudio = SimSystemAudio::new(15);
        let config = small_config();
        let stale = config.desync_threshold() + Duration::from_millis(50);

        let session = RelaySession::connect(
            test_addr(),
            transport::shared(transport_ctl.clone()),
            capture::shared(capture_ctl.clone()),
            Arc::new(sysaudio),
            config,
        )
        .await
        .unwrap();

        wait_for(|| capture_ctl.pending_slots().len() == 4).await;
        capture_ctl.release_all(stale);

        // A second recorder session is opened and receives every slot
        // exactly once
        wait_for(|| capture_ctl.session_count() == 2).await;
        wait_for(|| capture_ctl.pending_slots().len() == 4).await;
        let mut slots = capture_ctl.pending_slots();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert_eq!(capture_ctl.submitted_total(), 4);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_buffer_pool_failure_rolls_back_transport_and_capture() {
        let transport_ctl = SimTransport::new();
        let capture_ctl = SimCapture::manual(440.0);
        let sysaudio = SimSystemAudio::new(15);

        // An unallocatable buffer size fails step (c)
        let config = RelayConfig {
            num_buffers: 1,
            samples_per_buffer: usize::MAX / 4,
            ..RelayConfig::default()
        };

        let result = RelaySession::connect(
            test_addr(),
            transport::shared(transport_ctl.clone()),
            capture::shared(capture_ctl.clone()),
            Arc::new(sysaudio),
            config,
        )
        .await;

        assert!(result.is_err());
        // Everything acquired before the failure was released again
        assert_eq!(transport_ctl.open_count(), 1);
        assert_eq!(transport_ctl.close_count(), 1);
        assert_eq!(transport_ctl.active_outputs(), 0);
        assert_eq!(capture_ctl.session_count(), 1);
    }

    #[tokio::test]
    async fn test_capture_open_failure_rolls_back_transport() {
        let transport_ctl = SimTransport::new();
        let capture_ctl = SimCapture::manual(440.0);
        capture_ctl.fail_next_open();
        let sysaudio = SimSystemAudio::new(15);

        let result = RelaySession::connect(
            test_addr(),
            transport::shared(transport_ctl.clone()),
            capture::shared(capture_ctl.clone()),
            Arc::new(sysaudio),
            small_config(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(transport_ctl.open_count(), 1);
        assert_eq!(transport_ctl.close_count(), 1);
    }

    #[tokio::test]
    async fn test_capture_start_failure_rolls_back_transport() {
        let transport_ctl = SimTransport::new();
        let capture_ctl = SimCapture::manual(440.0);
        capture_ctl.fail_next_start();
        let sysaudio = SimSystemAudio::new(15);

        let result = RelaySession::connect(
            test_addr(),
            transport::shared(transport_ctl.clone()),
            capture::shared(capture_ctl.clone()),
            Arc::new(sysaudio),
            small_config(),
        )
        .await;

        assert!(result.is_err());
        // The opened recorder session was stopped and the transport link released
        assert_eq!(capture_ctl.session_count(), 1);
        assert_eq!(transport_ctl.open_count(), 1);
        assert_eq!(transport_ctl.close_count(), 1);
        assert_eq!(transport_ctl.active_outputs(), 0);
    }
}
