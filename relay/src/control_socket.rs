//! A minimal line-delimited JSON control socket: one [`Request`] per line in,
//! one [`Response`] per line out. This is the same kind of illustrative
//! default as [`crate::transport::DirectConnector`] — actual RPC wire framing
//! is out of scope here, so a deployment that wants something richer (a real
//! framing, authentication, TLS) wires its own transport on top of
//! [`relay_spool::ControlSurface`] and [`relay_rpc`]'s request/response types.

use std::{path::Path, sync::Arc};

use futures::{io::BufReader, AsyncBufReadExt, AsyncWriteExt, StreamExt};
use relay_client::Connector;
use relay_spool::{ControlSurface, Storage};
use smol::net::unix::UnixListener;
use tracing::{info, warn};

#[derive(serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Status,
    Freeze(relay_rpc::FreezeRequest),
    Send(relay_rpc::SendRequest),
    Remove(relay_rpc::RemoveRequest),
    Recover(relay_rpc::RecoverRequest),
    SetMaxConcurrentSendJobs(relay_rpc::SetMaxConcurrentSendJobsRequest),
}

#[derive(serde::Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Response {
    Status(relay_rpc::StatusResponse),
    Batch(relay_rpc::BatchResponse),
    Ack,
    Error { message: String },
}

pub async fn run<S, Cn>(
    socket_path: &Path,
    control: Arc<ControlSurface<S, Cn>>,
    shutdown: smol::channel::Receiver<()>,
) -> anyhow::Result<()>
where
    S: Storage,
    Cn: Connector,
{
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "control socket listening");

    let mut incoming = listener.incoming();
    loop {
        let next = smol::future::or(async { Some(incoming.next().await) }, async {
            let _ = shutdown.recv().await;
            None
        })
        .await;
        let stream = match next {
            Some(Some(Ok(s))) => s,
            Some(Some(Err(e))) => {
                warn!(error = %e, "failed to accept a control connection");
                continue;
            }
            Some(None) => return Ok(()),
            None => {
                info!("control socket shutting down");
                let _ = std::fs::remove_file(socket_path);
                return Ok(());
            }
        };
        let control = control.clone();
        smol::spawn(async move {
            if let Err(e) = handle_connection(stream, &control).await {
                warn!(error = %e, "control connection ended with an error");
            }
        })
        .detach();
    }
}

async fn handle_connection<S, Cn>(
    stream: smol::net::unix::UnixStream,
    control: &ControlSurface<S, Cn>,
) -> anyhow::Result<()>
where
    S: Storage,
    Cn: Connector,
{
    let (reader, mut writer) = futures::AsyncReadExt::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<Request>(line.trim_end()) {
            Ok(request) => dispatch(control, request).await,
            Err(e) => Response::Error { message: e.to_string() },
        };

        let mut out = serde_json::to_string(&response).unwrap_or_else(|e| format!(r#"{{"op":"error","message":{:?}}}"#, e.to_string()));
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
}

async fn dispatch<S, Cn>(control: &ControlSurface<S, Cn>, request: Request) -> Response
where
    S: Storage,
    Cn: Connector,
{
    match request {
        Request::Status => match control.status().await {
            Ok(status) => Response::Status((&status).into()),
            Err(e) => Response::Error { message: e.to_string() },
        },
        Request::Freeze(req) => Response::Batch(relay_rpc::BatchResponse::from_results(&req.ids, control.freeze(&req.ids).await)),
        Request::Send(req) => Response::Batch(relay_rpc::BatchResponse::from_results(
            &req.ids,
            control.send(req.retry_intervals, &req.ids).await,
        )),
        Request::Remove(req) => Response::Batch(relay_rpc::BatchResponse::from_results(&req.ids, control.remove(&req.ids).await)),
        Request::Recover(req) => Response::Batch(relay_rpc::BatchResponse::from_results(&req.ids, control.recover(&req.ids).await)),
        Request::SetMaxConcurrentSendJobs(req) => {
            control.set_max_concurrent_send_jobs(req.n).await;
            Response::Ack
        }
    }
}
