//! Session lifecycle and the real-time muxing task.
//!
//! A [`Session`] moves through `Unconfigured → Configured → Running →
//! Stopped`. Setup calls are accepted until the session starts; each one
//! re-validates the whole composition so that PID conflicts and
//! unsupported profiles surface before any packet is emitted.
//!
//! Once running, one spawned task owns the [`TSMuxer`] and the
//! [`OutputTransport`]. Producers feed it through bounded per-stream queues
//! obtained with [`Session::sender`]. The task paces itself on the slot
//! clock: it sleeps until a datagram's last packet is due, never longer.

use crate::av::{AccessUnit, InputProgram, OutputStream};
use crate::config::{MuxConfig, OutputConfig};
use crate::error::{MuxError, Result};
use crate::format::output::{OutputTransport, PacketSink};
use crate::format::ts::types::ticks_to_duration;
use crate::format::ts::{Program, TSMuxer};
use crate::stats::{MuxStats, StatsSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Program, streams, mux or output configuration still missing
    Unconfigured,
    /// Ready to start
    Configured,
    Running,
    Stopped,
}

/// What a producer hands to the muxing task
#[derive(Debug)]
enum StreamInput {
    Unit(AccessUnit),
    Discontinuity,
}

enum Control {
    ReassignPid {
        stream_id: u32,
        pid: u16,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Producer handle for one elementary stream.
#[derive(Debug, Clone)]
pub struct StreamSender {
    stream_id: u32,
    tx: mpsc::Sender<StreamInput>,
    timeout: std::time::Duration,
}

impl StreamSender {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Queues an access unit.
    ///
    /// Waits at most `queue_timeout` for room; a queue that stays full means
    /// the producer outruns the output budget and fails with
    /// `RateBudgetExceeded`.
    pub async fn send(&self, unit: AccessUnit) -> Result<()> {
        self.send_input(StreamInput::Unit(unit)).await
    }

    /// Flags the next unit as starting a new timeline.
    pub async fn mark_discontinuity(&self) -> Result<()> {
        self.send_input(StreamInput::Discontinuity).await
    }

    async fn send_input(&self, input: StreamInput) -> Result<()> {
        match self.tx.send_timeout(input, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(MuxError::RateBudgetExceeded(format!(
                "stream {} queue stayed full for {:?}",
                self.stream_id, self.timeout
            ))),
            Err(SendTimeoutError::Closed(_)) => Err(MuxError::InvalidState {
                operation: "send",
                state: SessionState::Stopped,
            }),
        }
    }
}

/// One muxing session and everything it owns.
pub struct Session {
    state: SessionState,
    input: Option<InputProgram>,
    outputs: Option<Vec<OutputStream>>,
    mux_config: Option<MuxConfig>,
    output_config: Option<OutputConfig>,
    program: Option<Program>,
    stats: Arc<MuxStats>,
    senders: HashMap<u32, StreamSender>,
    control: Option<mpsc::UnboundedSender<Control>>,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unconfigured,
            input: None,
            outputs: None,
            mux_config: None,
            output_config: None,
            program: None,
            stats: MuxStats::new(),
            senders: HashMap::new(),
            control: None,
            stop: None,
            task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> Arc<MuxStats> {
        self.stats.clone()
    }

    /// The composed program, once program, streams and mux configuration are set
    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    fn ensure_setup(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SessionState::Unconfigured | SessionState::Configured => Ok(()),
            state => Err(MuxError::InvalidState { operation, state }),
        }
    }

    /// Builds the program if every input to it is known, then settles the state.
    fn compose(
        &mut self,
        input: Option<InputProgram>,
        outputs: Option<Vec<OutputStream>>,
        mux_config: Option<MuxConfig>,
    ) -> Result<()> {
        let program = match (&input, &outputs, &mux_config) {
            (Some(input), Some(outputs), Some(config)) => Some(Program::build(input, outputs, config)?),
            _ => None,
        };
        self.input = input;
        self.outputs = outputs;
        self.mux_config = mux_config;
        self.program = program;
        self.state = if self.program.is_some() && self.output_config.is_some() {
            SessionState::Configured
        } else {
            SessionState::Unconfigured
        };
        Ok(())
    }

    pub fn setup_program(&mut self, input: InputProgram) -> Result<()> {
        self.ensure_setup("setup_program")?;
        self.compose(Some(input), self.outputs.clone(), self.mux_config.clone())
    }

    pub fn setup_streams(&mut self, outputs: Vec<OutputStream>) -> Result<()> {
        self.ensure_setup("setup_streams")?;
        self.compose(self.input.clone(), Some(outputs), self.mux_config.clone())
    }

    pub fn setup_muxer(&mut self, config: MuxConfig) -> Result<()> {
        self.ensure_setup("setup_muxer")?;
        config.validate()?;
        self.compose(self.input.clone(), self.outputs.clone(), Some(config))
    }

    pub fn setup_output(&mut self, config: OutputConfig) -> Result<()> {
        self.ensure_setup("setup_output")?;
        config.target()?;
        self.output_config = Some(config);
        self.compose(self.input.clone(), self.outputs.clone(), self.mux_config.clone())
    }

    /// Opens the configured UDP destination and starts muxing.
    pub async fn start(&mut self) -> Result<()> {
        self.ensure_startable()?;
        let config = self.output_config.clone().ok_or(MuxError::InvalidState {
            operation: "start",
            state: self.state,
        })?;
        let transport = OutputTransport::connect(&config, self.stats.clone()).await?;
        self.launch(transport)
    }

    /// Starts muxing into `sink` instead of a socket.
    pub fn start_with_sink(&mut self, sink: Box<dyn PacketSink>) -> Result<()> {
        self.ensure_startable()?;
        let config = self.output_config.clone().ok_or(MuxError::InvalidState {
            operation: "start",
            state: self.state,
        })?;
        let target = config.target()?;
        let transport = OutputTransport::new(sink, &config, target.packets_per_datagram, self.stats.clone());
        self.launch(transport)
    }

    fn ensure_startable(&self) -> Result<()> {
        if self.state != SessionState::Configured {
            return Err(MuxError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        Ok(())
    }

    fn launch(&mut self, transport: OutputTransport) -> Result<()> {
        let (program, config) = match (self.program.clone(), self.mux_config.clone()) {
            (Some(program), Some(config)) => (program, config),
            _ => {
                return Err(MuxError::InvalidState {
                    operation: "start",
                    state: self.state,
                })
            }
        };
        let stream_ids: Vec<u32> = program.streams.iter().map(|s| s.stream_id).collect();
        let encapsulation = if transport.is_rtp() { "rtp" } else { "raw udp" };
        let muxer = TSMuxer::new(program, &config, self.stats.clone())?;

        let mut inputs = Vec::with_capacity(stream_ids.len());
        for stream_id in stream_ids {
            let (tx, rx) = mpsc::channel(config.queue_depth);
            self.senders.insert(
                stream_id,
                StreamSender {
                    stream_id,
                    tx,
                    timeout: config.queue_timeout,
                },
            );
            inputs.push(StreamQueue {
                stream_id,
                rx,
                closed: false,
            });
        }
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mux_loop = MuxLoop {
            muxer,
            transport,
            inputs,
            control: control_rx,
            stop: stop_rx,
            stats: self.stats.clone(),
            epoch: Instant::now(),
        };
        self.stats.mark_started();
        self.task = Some(tokio::spawn(mux_loop.run()));
        self.control = Some(control_tx);
        self.stop = Some(stop_tx);
        self.state = SessionState::Running;
        log::info!(
            "session started with {} streams over {}",
            self.senders.len(),
            encapsulation
        );
        Ok(())
    }

    /// Producer handle for `stream_id`
    pub fn sender(&self, stream_id: u32) -> Result<StreamSender> {
        if self.state != SessionState::Running {
            return Err(MuxError::InvalidState {
                operation: "sender",
                state: self.state,
            });
        }
        self.senders
            .get(&stream_id)
            .cloned()
            .ok_or(MuxError::UnknownStream(stream_id))
    }

    /// Whether the muxing task has ended on its own (after a fatal error)
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_some_and(|task| task.is_finished())
    }

    /// Moves a stream to another PID; while running, the new PMT goes out at
    /// the next opportunity.
    pub async fn reassign_pid(&mut self, stream_id: u32, pid: u16) -> Result<()> {
        match self.state {
            SessionState::Configured => match self.program.as_mut() {
                Some(program) => program.reassign_pid(stream_id, pid).map(|_| ()),
                None => Err(MuxError::InvalidState {
                    operation: "reassign_pid",
                    state: self.state,
                }),
            },
            SessionState::Running => {
                let (reply, response) = oneshot::channel();
                let sent = self.control.as_ref().map(|control| {
                    control.send(Control::ReassignPid {
                        stream_id,
                        pid,
                        reply,
                    })
                });
                let stopped = MuxError::InvalidState {
                    operation: "reassign_pid",
                    state: SessionState::Stopped,
                };
                match sent {
                    Some(Ok(())) => response.await.map_err(|_| stopped)?,
                    _ => Err(stopped),
                }
            }
            state => Err(MuxError::InvalidState {
                operation: "reassign_pid",
                state,
            }),
        }
    }

    /// Stops accepting input, emits everything already accepted and releases
    /// the output.
    ///
    /// Returns the final counters, or the fatal error that ended the session.
    pub async fn stop(&mut self) -> Result<StatsSnapshot> {
        if self.state != SessionState::Running {
            return Err(MuxError::InvalidState {
                operation: "stop",
                state: self.state,
            });
        }
        if let Some(stop) = self.stop.take() {
            // The task may already be gone after a fatal error
            let _ = stop.send(true);
        }
        self.senders.clear();
        self.control = None;
        self.state = SessionState::Stopped;

        let outcome = match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| MuxError::TransportError(format!("muxing task failed: {}", e)))?,
            None => Ok(()),
        };
        log::info!("session stopped");
        outcome.map(|()| self.stats.snapshot())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
    }
}

struct StreamQueue {
    stream_id: u32,
    rx: mpsc::Receiver<StreamInput>,
    closed: bool,
}

/// The task that owns the muxer and the output.
struct MuxLoop {
    muxer: TSMuxer,
    transport: OutputTransport,
    inputs: Vec<StreamQueue>,
    control: mpsc::UnboundedReceiver<Control>,
    stop: watch::Receiver<bool>,
    stats: Arc<MuxStats>,
    /// Wall-clock instant of STC zero
    epoch: Instant,
}

impl MuxLoop {
    async fn run(mut self) -> Result<()> {
        let result = self.pump().await;
        if let Err(e) = &result {
            log::error!("session ended: {}", e);
            self.stats.set_last_error(e);
        }
        result
    }

    fn deadline(&self, stc: u64) -> Instant {
        self.epoch + ticks_to_duration(stc)
    }

    async fn pump(&mut self) -> Result<()> {
        let mut stopping = false;
        loop {
            if !stopping && *self.stop.borrow() {
                stopping = true;
                for queue in &mut self.inputs {
                    queue.rx.close();
                }
                log::info!("stop requested, draining accepted units");
            }

            while let Ok(control) = self.control.try_recv() {
                match control {
                    Control::ReassignPid {
                        stream_id,
                        pid,
                        reply,
                    } => {
                        let result = self.muxer.reassign_pid(stream_id, pid);
                        if let Err(e) = &result {
                            log::warn!("pid reassignment of stream {} refused: {}", stream_id, e);
                        }
                        let _ = reply.send(result);
                    }
                }
            }

            let inputs_empty = self.pull_inputs()?;
            if stopping && inputs_empty && self.muxer.is_drained() {
                break;
            }

            match self.muxer.next_packet()? {
                Some(packet) => {
                    if self.transport.completes_datagram() {
                        sleep_until(self.deadline(packet.at)).await;
                    }
                    self.transport.push(&packet).await?;
                }
                None => {
                    // Slot left empty by the smoothing buffer
                    self.transport.flush().await?;
                    sleep_until(self.deadline(self.muxer.now())).await;
                }
            }
        }
        self.transport.flush().await
    }

    /// Moves queued units into the muxer's lookahead.
    ///
    /// Returns true when every queue was found empty.
    fn pull_inputs(&mut self) -> Result<bool> {
        let mut all_empty = true;
        for queue in &mut self.inputs {
            if queue.closed {
                continue;
            }
            loop {
                if !self.muxer.wants_input(queue.stream_id) {
                    all_empty = false;
                    break;
                }
                let input = match queue.rx.try_recv() {
                    Ok(input) => input,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        queue.closed = true;
                        break;
                    }
                };
                match input {
                    StreamInput::Unit(unit) => match self.muxer.push(queue.stream_id, unit) {
                        Ok(()) => {}
                        Err(e) if e.is_recoverable() => {
                            log::warn!("stream {}: access unit dropped: {}", queue.stream_id, e)
                        }
                        Err(e) => return Err(e),
                    },
                    StreamInput::Discontinuity => self.muxer.mark_discontinuity(queue.stream_id)?,
                }
            }
        }
        Ok(all_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{InputStream, StreamFormat, Timebase};
    use crate::config::TsType;
    use crate::format::output::MemorySink;
    use std::time::Duration;

    fn input() -> InputProgram {
        InputProgram::new("Test", "Test")
            .with_stream(InputStream::video(1, StreamFormat::Avc, 1280, 720, Timebase::new(1, 25)))
    }

    #[test]
    fn test_state_machine() {
        let mut session = Session::new();
        assert_eq!(session.state(), SessionState::Unconfigured);
        assert!(matches!(
            session.start_with_sink(Box::new(MemorySink::new())),
            Err(MuxError::InvalidState { operation: "start", .. })
        ));

        session.setup_program(input()).unwrap();
        session.setup_streams(vec![OutputStream::passthrough(1)]).unwrap();
        session.setup_muxer(MuxConfig::default()).unwrap();
        assert_eq!(session.state(), SessionState::Unconfigured);
        session.setup_output(OutputConfig::udp("127.0.0.1:5000")).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        assert!(session.sender(1).is_err());
    }

    #[test]
    fn test_pid_conflict_keeps_session_unconfigured() {
        let mut session = Session::new();
        session
            .setup_program(input().with_stream(InputStream::audio(2, StreamFormat::Mp2, 0x3, 48_000)))
            .unwrap();
        session.setup_muxer(MuxConfig::default()).unwrap();
        session.setup_output(OutputConfig::udp("127.0.0.1:5000")).unwrap();
        let err = session
            .setup_streams(vec![
                OutputStream::passthrough(1).with_pid(256),
                OutputStream::passthrough(2).with_pid(256),
            ])
            .unwrap_err();
        assert!(matches!(err, MuxError::PidConflict { pid: 256, .. }));
        assert_eq!(session.state(), SessionState::Unconfigured);
        assert!(session.program().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_and_reports() {
        let sink = MemorySink::new();
        let mut session = Session::new();
        session.setup_program(input()).unwrap();
        session.setup_streams(vec![OutputStream::passthrough(1)]).unwrap();
        session.setup_muxer(MuxConfig::default()).unwrap();
        session.setup_output(OutputConfig::udp("127.0.0.1:5000")).unwrap();
        session.start_with_sink(Box::new(sink.clone())).unwrap();
        assert!(session.setup_muxer(MuxConfig::default()).is_err());

        let video = session.sender(1).unwrap();
        video.send(AccessUnit::new(vec![0x55; 4000]).with_pts(0)).await.unwrap();

        let stats = session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(stats.packets > 0);
        assert_eq!(stats.bytes_sent, stats.packets * 188);
        assert_eq!(sink.concat().len() as u64, stats.bytes_sent);
        assert!(matches!(
            video.send(AccessUnit::new(vec![0])).await,
            Err(MuxError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_producer_outrunning_output_is_refused() {
        let mut config = MuxConfig::new(TsType::Generic, 500_000);
        config.queue_depth = 1;
        config.queue_timeout = Duration::from_millis(50);
        config.max_deferral = Duration::from_secs(120);

        let mut session = Session::new();
        session.setup_program(input()).unwrap();
        session.setup_streams(vec![OutputStream::passthrough(1)]).unwrap();
        session.setup_muxer(config).unwrap();
        session.setup_output(OutputConfig::udp("127.0.0.1:5000")).unwrap();
        session.start_with_sink(Box::new(MemorySink::new())).unwrap();

        // Each unit takes 0.8 s of output but arrives every 40 ms
        let video = session.sender(1).unwrap();
        let mut refused = None;
        for pts in 0..50 {
            if let Err(e) = video.send(AccessUnit::new(vec![0x11; 50_000]).with_pts(pts)).await {
                refused = Some(e);
                break;
            }
        }
        assert!(matches!(refused, Some(MuxError::RateBudgetExceeded(_))));
        assert!(!session.is_finished());

        let stats = session.stop().await.unwrap();
        assert!(stats.packets > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_send_failure_ends_session() {
        let sink = MemorySink::new();
        sink.fail_next(1000);
        let mut output = OutputConfig::udp("127.0.0.1:5000");
        output.max_send_errors = 3;

        let mut session = Session::new();
        session.setup_program(input()).unwrap();
        session.setup_streams(vec![OutputStream::passthrough(1)]).unwrap();
        session.setup_muxer(MuxConfig::default()).unwrap();
        session.setup_output(output).unwrap();
        session.start_with_sink(Box::new(sink.clone())).unwrap();

        for _ in 0..100 {
            if session.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.is_finished());
        assert!(sink.datagrams().is_empty());

        let video = session.sender(1).unwrap();
        assert!(matches!(
            video.send(AccessUnit::new(vec![0])).await,
            Err(MuxError::InvalidState { .. })
        ));
        assert!(matches!(session.stop().await, Err(MuxError::TransportError(_))));
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
