use std::{
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tracing::{debug, info, warn};

use crate::{
    task::panic_message,
    wire::{decode_line, encode_line, PoolMessage, WireOutcome, WorkerMessage},
};

/// Evaluation function of a worker, operating on JSON values.
pub type WorkerHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Adapts a typed evaluation function to a [`WorkerHandler`].
#[must_use]
pub fn handler<I, O, E, F>(f: F) -> WorkerHandler
where
    I: DeserializeOwned,
    O: Serialize,
    E: fmt::Display,
    F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
{
    Arc::new(move |raw: Value| {
        let input: I =
            serde_json::from_value(raw).map_err(|err| format!("input does not decode: {err}"))?;
        let output = f(&input).map_err(|err| err.to_string())?;
        serde_json::to_value(output).map_err(|err| format!("output does not serialize: {err}"))
    })
}

fn invalid_data(err: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &WorkerMessage) -> io::Result<()> {
    let line = encode_line(message).map_err(invalid_data)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Serves one link: announces `model`, then answers requests until the
/// reader reaches end of input. Returns the number of requests answered.
///
/// Evaluations run on the blocking pool; errors and panics are sent back as
/// error outcomes and never end the loop.
pub async fn serve_lines<R, W>(
    model: &str,
    handler: WorkerHandler,
    mut reader: R,
    mut writer: W,
) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send(
        &mut writer,
        &WorkerMessage::Ready {
            model: model.to_owned(),
            pid: std::process::id(),
        },
    )
    .await?;
    let mut served = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let PoolMessage::Evaluate { index, input } =
            decode_line(&line).map_err(|err| invalid_data(format!("malformed request: {err}")))?;
        let handler = Arc::clone(&handler);
        let evaluated = tokio::task::spawn_blocking(move || {
            panic::catch_unwind(AssertUnwindSafe(|| handler(input)))
        })
        .await;
        let outcome = match evaluated {
            Ok(Ok(result)) => WireOutcome::from(result),
            Ok(Err(payload)) => {
                WireOutcome::Err(format!("panicked: {}", panic_message(payload.as_ref())))
            }
            Err(err) => WireOutcome::Err(format!("evaluation aborted: {err}")),
        };
        if let WireOutcome::Err(message) = &outcome {
            warn!(index, %message, "evaluation failed");
        }
        send(&mut writer, &WorkerMessage::Result { index, outcome }).await?;
        served += 1;
    }
    debug!(served, "link closed by pool");
    Ok(served)
}

/// Serves a single pool over standard input and output.
pub async fn serve_stdio(model: &str, handler: WorkerHandler) -> io::Result<usize> {
    serve_lines(
        model,
        handler,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Accepts connections forever, serving each on its own task.
pub async fn serve_tcp(listener: TcpListener, model: String, handler: WorkerHandler) -> io::Result<()> {
    let local = listener.local_addr()?;
    info!(%local, %model, "worker listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let model = model.clone();
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            match serve_lines(&model, handler, BufReader::new(reader), writer).await {
                Ok(served) => info!(%peer, served, "connection closed"),
                Err(err) => warn!(%peer, error = %err, "connection failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn divide() -> WorkerHandler {
        handler(|x: &f64| {
            if *x == 0.0 {
                return Err("division by zero");
            }
            if x.is_sign_negative() {
                panic!("negative input");
            }
            Ok(10.0 / x)
        })
    }

    #[tokio::test]
    async fn answers_every_request_in_order() {
        let requests = [1.0, 0.0, -1.0, 4.0]
            .iter()
            .enumerate()
            .map(|(index, x)| {
                encode_line(&PoolMessage::Evaluate {
                    index,
                    input: json!(x),
                })
                .unwrap()
            })
            .collect::<String>();
        let mut output = Vec::new();
        let served = serve_lines("divide", divide(), requests.as_bytes(), &mut output)
            .await
            .unwrap();
        assert_eq!(served, 4);

        let lines: Vec<WorkerMessage> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| decode_line(line).unwrap())
            .collect();
        assert!(matches!(&lines[0], WorkerMessage::Ready { model, .. } if model == "divide"));
        assert_eq!(
            lines[1],
            WorkerMessage::Result {
                index: 0,
                outcome: WireOutcome::Ok(json!(10.0))
            }
        );
        assert_eq!(
            lines[2],
            WorkerMessage::Result {
                index: 1,
                outcome: WireOutcome::Err("division by zero".into())
            }
        );
        assert!(matches!(
            &lines[3],
            WorkerMessage::Result { index: 2, outcome: WireOutcome::Err(msg) } if msg.contains("negative input")
        ));
        assert_eq!(
            lines[4],
            WorkerMessage::Result {
                index: 3,
                outcome: WireOutcome::Ok(json!(2.5))
            }
        );
    }

    #[tokio::test]
    async fn undecodable_input_is_an_error_outcome() {
        let request = "{\"type\":\"evaluate\",\"index\":0,\"input\":\"abc\"}\n";
        let mut output = Vec::new();
        serve_lines("divide", divide(), request.as_bytes(), &mut output)
            .await
            .unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.lines().nth(1).unwrap().contains("input does not decode"));
    }

    #[tokio::test]
    async fn malformed_request_ends_the_link() {
        let mut output = Vec::new();
        let err = serve_lines("divide", divide(), "not json\n".as_bytes(), &mut output)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
