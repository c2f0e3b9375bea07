//! Channel I/O loop (§4.F): shuttles bytes between the SSH exec channel and
//! the relay's local stdin/stdout, and maps exit status/signal to an
//! [`ExitOutcome`].

use bytes::Bytes;
use cockpit_ssh_common::ExitCode;
use russh::{Channel, ChannelMsg, Sig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::*;

use super::error::SshClientError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(ExitCode),
}

/// Tracks whether a well-formed frame has been seen on stdout yet, per the
/// first-frame heuristic: a nonzero exit before the first frame means the
/// remote shell could not find the bridge command, not that the bridge
/// itself failed.
#[derive(Default)]
struct FrameLatch {
    received_frame: bool,
}

impl FrameLatch {
    fn observe(&mut self, data: &[u8]) {
        if self.received_frame {
            return;
        }
        if let Some(nl) = data.iter().position(|&b| b == b'\n') {
            let digits = &data[..nl];
            if !digits.is_empty()
                && digits.iter().all(|b| b.is_ascii_digit())
                && std::str::from_utf8(digits)
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
                    .is_some()
            {
                self.received_frame = true;
            }
        }
    }

    fn exit_status_outcome(&self, status: u32) -> ExitCode {
        match status {
            0 if self.received_frame => ExitCode::Success,
            127 => ExitCode::NoCockpit,
            _ if !self.received_frame => ExitCode::NoCockpit,
            _ => ExitCode::InternalError,
        }
    }
}

fn signal_outcome(signal_name: &Sig) -> ExitCode {
    let name = match signal_name {
        Sig::TERM => "TERM",
        Sig::Custom(c) => c.as_str(),
        _ => "",
    };
    if name == "TERM" || name == "Terminated" {
        ExitCode::Terminated
    } else {
        ExitCode::InternalError
    }
}

/// Drives the channel until the remote process exits, the channel closes, or
/// local I/O ends. `local_in`/`local_out` stand in for the relay's stdio.
pub async fn run_io_loop<R, W>(
    mut channel: Channel<russh::client::Msg>,
    mut local_in: R,
    mut local_out: W,
) -> Result<ExitCode, SshClientError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut latch = FrameLatch::default();
    let mut local_eof_sent = false;
    let mut ssh_eof_received = false;
    let mut read_buf = [0u8; 8192];

    loop {
        tokio::select! {
            n = local_in.read(&mut read_buf), if !local_eof_sent => {
                match n {
                    Ok(0) => {
                        channel.eof().await?;
                        local_eof_sent = true;
                    }
                    Ok(n) => {
                        channel.data(&read_buf[..n]).await?;
                    }
                    Err(err) => return Err(SshClientError::other(err)),
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let raw: &[u8] = &data;
                        let bytes = Bytes::from(raw.to_vec());
                        latch.observe(&bytes);
                        local_out.write_all(&bytes).await.map_err(SshClientError::other)?;
                        local_out.flush().await.map_err(SshClientError::other)?;
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if !latch.received_frame {
                            debug!("stderr before first frame: {}", String::from_utf8_lossy(&data));
                        }
                    }
                    Some(ChannelMsg::Eof) => {
                        ssh_eof_received = true;
                        if local_eof_sent {
                            channel.close().await?;
                        }
                    }
                    Some(ChannelMsg::Close) => {
                        channel.close().await.ok();
                        if !ssh_eof_received {
                            return Ok(ExitCode::Disconnected);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        return Ok(latch.exit_status_outcome(exit_status));
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        return Ok(signal_outcome(&signal_name));
                    }
                    Some(_) => {}
                    None => return Ok(ExitCode::Disconnected),
                }
            }
        }
    }
}
