// FILE: src/worker/protocol.rs
//! Newline-delimited JSON framing for the parent↔worker wire protocol
//! (§4.2). Frames are plain `serde_json` values, one per line, so both
//! sides can use a line-buffered reader exactly the way the teacher's
//! `terminal_tool.rs` buffers a child's stdout with
//! `tokio::io::BufReader::lines()`.

use crate::error::AppError;
use crate::model::{Command, WorkerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub async fn write_command<W: AsyncWrite + Unpin>(writer: &mut W, command: &Command) -> Result<(), AppError> {
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut tokio::io::Lines<BufReader<R>>,
) -> Result<Option<WorkerMessage>, AppError> {
    match reader.next_line().await? {
        Some(line) if line.trim().is_empty() => Ok(None),
        Some(line) => {
            let msg: WorkerMessage = serde_json::from_str(&line)
                .map_err(|e| AppError::ProtocolError(format!("malformed worker frame: {} ({})", e, line)))?;
            Ok(Some(msg))
        }
        None => Ok(None),
    }
}

pub fn lines_of<R: tokio::io::AsyncRead + Unpin>(reader: R) -> tokio::io::Lines<BufReader<R>> {
    BufReader::new(reader).lines()
}

/// Reads one `Command` frame from the worker's stdin.
pub async fn read_message_raw<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut tokio::io::Lines<BufReader<R>>,
) -> Result<Option<Command>, AppError> {
    loop {
        match reader.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => {
                let cmd: Command = serde_json::from_str(&line)
                    .map_err(|e| AppError::ProtocolError(format!("malformed command frame: {} ({})", e, line)))?;
                return Ok(Some(cmd));
            }
            None => return Ok(None),
        }
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &WorkerMessage) -> Result<(), AppError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandKind, CommandResult, CommandStatus};

    #[tokio::test]
    async fn command_round_trips_through_the_wire_format() {
        let cmd = Command {
            command_id: "c1".into(),
            kind: CommandKind::RunCode,
            payload: "display 2+2".into(),
            working_directory: None,
            deadline_seconds: 30.0,
            streaming_enabled: true,
            capture_graphs: false,
        };
        let mut buf = Vec::new();
        write_command(&mut buf, &cmd).await.unwrap();
        let mut lines = lines_of(&buf[..]);
        let line = lines.next_line().await.unwrap().unwrap();
        let decoded: Command = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.command_id, "c1");
        assert_eq!(decoded.payload, "display 2+2");
    }

    #[tokio::test]
    async fn result_message_round_trips() {
        let msg = WorkerMessage::Result(CommandResult {
            command_id: "c1".into(),
            status: CommandStatus::Ok,
            output_text: "4".into(),
            error_message: None,
            duration_ms: 12,
            artefacts: vec![],
        });
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        let mut lines = lines_of(&buf[..]);
        let decoded = read_message(&mut lines).await.unwrap().unwrap();
        match decoded {
            WorkerMessage::Result(r) => assert_eq!(r.output_text, "4"),
            _ => panic!("expected Result frame"),
        }
    }
}
