//! The worker side of the pool.
//!
//! [`serve`] is the whole life of a worker process: read a request, act on
//! it, answer, repeat until the pool closes the channel.

use crate::error::Result;
use crate::execution::{Request, Response, Task, TaskFailure, read_message, write_message};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Answer requests from `input` on `output` until the channel closes or a
/// [`Request::Shutdown`] arrives.
///
/// Task failures are reported back and do not end the loop. Only a broken
/// channel does.
pub fn serve<R: Read, W: Write>(shm_dir: &Path, input: R, output: W) -> Result<()> {
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);

    loop {
        let Some(request) = read_message::<_, Request>(&mut input)? else {
            tracing::debug!("control channel closed");
            return Ok(());
        };

        let response = match request {
            Request::Ping { seq } => Response::Pong { seq },
            Request::Run { task, start, end } => run_chunk(shm_dir, &task, start, end),
            Request::Shutdown => {
                tracing::debug!("shutdown requested");
                return Ok(());
            }
        };

        write_message(&mut output, &response)?;
        output.flush()?;
    }
}

fn run_chunk(shm_dir: &Path, task: &Task, start: u64, end: u64) -> Response {
    let mut current = start as usize;
    let result = task.attach(shm_dir).and_then(|mut bound| {
        for index in start as usize..end as usize {
            current = index;
            bound.apply(index)?;
        }
        Ok(())
    });

    match result {
        Ok(()) => Response::Done { start, end },
        Err(e) => {
            tracing::warn!(task = task.kind.name(), index = current, error = %e, "task failed");
            Response::Failed {
                failure: TaskFailure::from_error(&e, current),
            }
        }
    }
}
