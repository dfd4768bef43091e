//! Frame to packet assembly.
//!
//! The [`Processor`] sits at the end of a filter chain. It groups decoded
//! frames by task ID, `(connection ID << 32) | stream ID`, and hands each
//! assembled [`Packet`] to the [`Callback`] chosen by its [`Dispatch`]:
//!
//! - a Header frame that ends its message becomes a *simple task* run once
//!   with a buffered body;
//! - a Header frame that does not end its message becomes a *stream task*
//!   whose body is a [`StreamBody`] fed by the following Data and Trailer
//!   frames.
//!
//! A stream task never runs on two threads at once: frames arriving while
//! it runs mark it pending and the running thread loops.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use dashmap::DashMap;

use crate::{
    codec::{Frame, FrameType},
    error::Result,
    executor::{Executor, Task},
    filter::{Filter, FilterContext, Payload},
    packet::{Body, HeaderMap, Packet, StreamBody, StreamWriter},
    transport::Connection,
};

/// Task ID of `stream_id` on connection `conn_id`.
#[must_use]
pub fn task_id(conn_id: u32, stream_id: u32) -> u64 { (u64::from(conn_id) << 32) | u64::from(stream_id) }

/// Consumer of assembled packets.
pub trait Callback: Send + Sync {
    /// A message arrived. Stream bodies are still filling while this runs.
    fn on_packet(&self, conn: &Arc<Connection>, packet: Packet);

    /// More data arrived for a stream whose `on_packet` already returned.
    fn on_more_data(&self, _conn: &Arc<Connection>, _stream_id: u32) {}
}

impl<F> Callback for F
where
    F: Fn(&Arc<Connection>, Packet) + Send + Sync,
{
    fn on_packet(&self, conn: &Arc<Connection>, packet: Packet) { self(conn, packet); }
}

/// Chooses the callback for an inbound packet.
pub trait Dispatch: Send + Sync {
    /// Callback for `packet`, or `None` to drop it. May fill in routing
    /// details such as path parameters.
    fn resolve(&self, conn: &Arc<Connection>, packet: &mut Packet) -> Option<Arc<dyn Callback>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    RunningWithPending,
}

struct StreamTask {
    conn: Arc<Connection>,
    stream_id: u32,
    callback: Arc<dyn Callback>,
    writer: StreamWriter,
    packet: Mutex<Option<Packet>>,
    phase: Mutex<Phase>,
}

impl StreamTask {
    fn phase(&self) -> std::sync::MutexGuard<'_, Phase> { self.phase.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Mark new input; returns whether the task must be posted.
    fn schedule(&self) -> bool {
        let mut phase = self.phase();
        match *phase {
            Phase::Idle => {
                *phase = Phase::Running;
                true
            }
            Phase::Running | Phase::RunningWithPending => {
                *phase = Phase::RunningWithPending;
                false
            }
        }
    }

    fn run(&self) {
        loop {
            let first = self.packet.lock().unwrap_or_else(PoisonError::into_inner).take();
            match first {
                Some(packet) => self.callback.on_packet(&self.conn, packet),
                None => self.callback.on_more_data(&self.conn, self.stream_id),
            }
            let mut phase = self.phase();
            if *phase == Phase::RunningWithPending {
                *phase = Phase::Running;
            } else {
                *phase = Phase::Idle;
                return;
            }
        }
    }
}

/// Last filter of a chain: assembles packets and runs their callbacks on
/// an executor.
pub struct Processor {
    executor: Arc<dyn Executor>,
    dispatch: Arc<dyn Dispatch>,
    streams: DashMap<u64, Arc<StreamTask>>,
}

impl Processor {
    /// Name in the chain.
    pub const NAME: &'static str = "processor";

    /// Processor running callbacks chosen by `dispatch` on `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, dispatch: Arc<dyn Dispatch>) -> Self {
        Self {
            executor,
            dispatch,
            streams: DashMap::new(),
        }
    }

    /// Stream tasks still receiving frames.
    #[must_use]
    pub fn active_streams(&self) -> usize { self.streams.len() }

    fn post_stream(&self, task: &Arc<StreamTask>) -> Result<()> {
        if !task.schedule() {
            return Ok(());
        }
        let id = task_id(task.conn.id(), task.stream_id);
        let task = Arc::clone(task);
        self.executor.post(Task::with_index(id, move || task.run()))?;
        Ok(())
    }

    fn on_header(&self, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
        let Frame {
            end,
            stream_id,
            ident,
            header,
            payload,
            ..
        } = frame;
        let mut packet = Packet::new(ident.unwrap_or_default());
        packet.header = header.unwrap_or_default();
        packet.stream_id = stream_id;
        if end {
            packet.body = payload.map_or(Body::Empty, Body::from_buffer);
            let Some(callback) = self.resolve(conn, &mut packet) else {
                return Ok(());
            };
            let conn = Arc::clone(conn);
            self.executor.post(Task::with_index(task_id(conn.id(), stream_id), move || {
                callback.on_packet(&conn, packet);
            }))?;
            return Ok(());
        }
        let (body, writer) = StreamBody::channel();
        if let Some(buf) = payload {
            writer.write(buf)?;
        }
        packet.body = Body::Stream(body);
        let Some(callback) = self.resolve(conn, &mut packet) else {
            return Ok(());
        };
        let task = Arc::new(StreamTask {
            conn: Arc::clone(conn),
            stream_id,
            callback,
            writer,
            packet: Mutex::new(Some(packet)),
            phase: Mutex::new(Phase::Idle),
        });
        let id = task_id(conn.id(), stream_id);
        if let Some(stale) = self.streams.insert(id, Arc::clone(&task)) {
            tracing::debug!(conn_id = conn.id(), stream_id, "stream restarted before it ended");
            stale.writer.close();
        }
        self.post_stream(&task)
    }

    fn on_continuation(&self, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
        let id = task_id(conn.id(), frame.stream_id);
        let task = if frame.end {
            self.streams.remove(&id).map(|(_, task)| task)
        } else {
            self.streams.get(&id).map(|e| Arc::clone(e.value()))
        };
        let Some(task) = task else {
            tracing::debug!(conn_id = conn.id(), stream_id = frame.stream_id, "frame for unknown stream dropped");
            return Ok(());
        };
        if let Some(buf) = frame.payload {
            task.writer.write(buf)?;
        }
        if frame.kind == FrameType::Trailer {
            task.writer.finish(frame.trailer.unwrap_or_else(HeaderMap::new));
        } else if frame.end {
            task.writer.flush();
        }
        self.post_stream(&task)
    }

    fn resolve(&self, conn: &Arc<Connection>, packet: &mut Packet) -> Option<Arc<dyn Callback>> {
        let callback = self.dispatch.resolve(conn, packet);
        if callback.is_none() {
            tracing::debug!(
                conn_id = conn.id(),
                seq_id = packet.ident.seq_id,
                request = packet.ident.is_request,
                "no callback for packet"
            );
        }
        callback
    }
}

impl Filter for Processor {
    fn name(&self) -> &str { Self::NAME }

    fn handle_read(&self, ctx: &mut FilterContext) -> Result<()> {
        let Payload::Frame(frame) = ctx.take_payload() else {
            return Ok(());
        };
        let conn = Arc::clone(ctx.conn());
        match frame.kind {
            FrameType::Header => self.on_header(&conn, frame),
            FrameType::Data | FrameType::Trailer => self.on_continuation(&conn, frame),
        }
    }

    fn handle_close(&self, ctx: &mut FilterContext) -> Result<()> {
        let conn_id = ctx.conn().id();
        self.streams.retain(|id, task| {
            if id >> 32 == u64::from(conn_id) {
                task.writer.close();
                false
            } else {
                true
            }
        });
        Ok(())
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("active_streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
