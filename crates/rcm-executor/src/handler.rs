//! Completion Handler.

use rcm_core::completion::{WcOpcode, WorkCompletion};
use rcm_core::error::{FabricError, Result};
use rcm_core::progress::{Progress, ProgressSink};

use crate::connection::ConnectionTable;

use std::sync::Arc;

/// Interprets drained completions. Runs on the poller thread.
pub struct CompletionHandler {
    table: Arc<ConnectionTable>,
    sink: Arc<dyn ProgressSink>,
}

impl CompletionHandler {
    pub fn new(table: Arc<ConnectionTable>, sink: Arc<dyn ProgressSink>) -> Self {
        Self { table, sink }
    }

    /// Any status but success is fatal.
    pub fn handle(&self, wc: &WorkCompletion) -> Result<()> {
        if !wc.is_success() {
            return Err(FabricError::CompletionStatus {
                conn: wc.wr_id,
                opcode: wc.opcode,
                status: wc.status,
            });
        }

        match wc.opcode {
            WcOpcode::Recv => {
                let found = self.table.with(wc.wr_id, |conn| {
                    // Safety: this completion retires the only receive posted
                    // on the connection, and the table lock keeps teardown out.
                    let message = unsafe { conn.received(wc.byte_len) };
                    log::debug!("{}: received {} bytes", wc.wr_id, message.len());
                    self.sink.report(Progress::Received {
                        conn: wc.wr_id,
                        message,
                    });
                });
                if found.is_none() {
                    log::warn!("{}: receive completed after teardown", wc.wr_id);
                }
            }
            WcOpcode::Send => {
                log::debug!("{}: send completed", wc.wr_id);
                self.sink.report(Progress::SendCompleted(wc.wr_id));
            }
        }
        Ok(())
    }
}
