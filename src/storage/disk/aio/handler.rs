//! # Handler Threads
//!
//! One OS thread per global segment, each looping on
//! [`IoSubsystem::handle_completion`] and handing every claimed request to a
//! [`CompletionHandler`].
//!
//! ```text
//!   segment 0 ──► aio-handler-0 ──┐
//!   segment 1 ──► aio-handler-1 ──┤
//!      ...                        ├──► CompletionHandler::on_complete(segment, completion)
//!   segment N ──► aio-handler-N ──┘
//! ```
//!
//! Each thread owns its scratch buffer, so merged runs never contend for memory.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, trace};

use crate::common::config::SegmentId;
use crate::common::exception::AioError;
use crate::storage::disk::aio::slot::Completion;
use crate::storage::disk::aio::stats::SegmentState;
use crate::storage::disk::aio::subsystem::IoSubsystem;
use crate::storage::disk::direct_io::AlignedBuffer;

/// Receives every claimed request. Called from handler threads, so it must
/// not block for long: the segment serves nothing else meanwhile.
pub trait CompletionHandler: Send + Sync {
    fn on_complete(&self, segment: SegmentId, completion: Completion);
}

impl<F> CompletionHandler for F
where
    F: Fn(SegmentId, Completion) + Send + Sync,
{
    fn on_complete(&self, segment: SegmentId, completion: Completion) {
        self(segment, completion)
    }
}

#[derive(Debug)]
pub struct IoHandlerPool {
    subsystem: Arc<IoSubsystem>,
    handlers: Vec<JoinHandle<()>>,
}

impl IoHandlerPool {
    /// Spawns one handler thread per global segment.
    pub fn start(
        subsystem: Arc<IoSubsystem>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<Self, AioError> {
        let n_segments = subsystem.n_segments();
        let mut pool = Self {
            subsystem: Arc::clone(&subsystem),
            handlers: Vec::with_capacity(n_segments),
        };

        for segment in 0..n_segments {
            let subsystem = Arc::clone(&subsystem);
            let handler = Arc::clone(&handler);
            let name = format!("aio-handler-{}", segment);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || Self::handler_loop(segment, &subsystem, handler.as_ref()));

            match spawned {
                Ok(join) => pool.handlers.push(join),
                Err(source) => {
                    // Threads already running are stopped by the pool's Drop.
                    return Err(AioError::Io {
                        file: name,
                        operation: "spawn",
                        source,
                    });
                }
            }
        }

        info!("Started {} aio handler threads", n_segments);
        Ok(pool)
    }

    fn handler_loop(segment: SegmentId, subsystem: &IoSubsystem, handler: &dyn CompletionHandler) {
        debug!("aio handler for segment {} started", segment);
        let mut scratch = AlignedBuffer::with_page_alignment();

        while let Some(completion) = subsystem.handle_completion(segment, &mut scratch) {
            trace!(
                "segment {}: completed {:?} of {} bytes at offset {} (message {})",
                segment,
                completion.op,
                completion.len,
                completion.offset,
                completion.message1
            );
            handler.on_complete(segment, completion);
        }

        subsystem.mark_segment(segment, SegmentState::Exited);
        debug!("aio handler for segment {} exited", segment);
    }

    pub fn n_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn subsystem(&self) -> &Arc<IoSubsystem> {
        &self.subsystem
    }

    /// Shuts the subsystem down and joins every handler.
    pub fn shutdown(&mut self) {
        if self.handlers.is_empty() {
            return;
        }
        self.subsystem.shutdown();
        for join in self.handlers.drain(..) {
            if let Err(e) = join.join() {
                error!("Failed to join aio handler thread: {:?}", e);
            }
        }
        info!("All aio handler threads stopped");
    }
}

impl Drop for IoHandlerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
