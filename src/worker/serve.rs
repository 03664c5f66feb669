//! Worker-process side of the pool protocol.

use super::protocol::{decode_line, encode_line, Envelope, RemoteJob, Request, Response};
use crate::error::{AlignError, AlignResult, WireError};
use std::io::{BufRead, Write};
use tracing::{debug, error, info};

/// Serve jobs from `reader` until end of input, writing one response per
/// request to `writer`.
///
/// ## Failure handling:
/// - handler errors are sent back as [`WireError`]s, the loop continues
/// - a job that does not decode gets a serialization error reply if its id
///   can still be read
/// - a line without a readable id, or an I/O failure, ends the loop with an
///   error, since the parent can no longer match replies
///
/// Returns the number of requests handled.
pub fn serve<J, R, W, F>(reader: R, mut writer: W, mut handler: F) -> AlignResult<usize>
where
    J: RemoteJob,
    R: BufRead,
    W: Write,
    F: FnMut(J) -> AlignResult<J::Output>,
{
    info!(job = J::NAME, pid = std::process::id(), "Worker ready");
    let mut handled = 0;

    for line in reader.lines() {
        let line = line.map_err(|e| AlignError::pool("reading request", e))?;
        if line.trim().is_empty() {
            continue;
        }

        let reply = match decode_line::<Request<J>>(&line, "decoding request") {
            Ok(request) => {
                debug!(id = %request.id, "Running job");
                let outcome = handler(request.job).map_err(|e| WireError::from(&e));
                encode_reply::<J>(request.id, outcome)?
            }
            Err(err) => {
                let envelope: Envelope = decode_line(&line, "decoding request id")?;
                error!(id = %envelope.id, error = %err, "Rejecting request");
                encode_line(
                    &Response::<J::Output> {
                        id: envelope.id,
                        outcome: Err(WireError::from(&err)),
                    },
                    "encoding reply",
                )?
            }
        };

        writer
            .write_all(reply.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| AlignError::pool("writing reply", e))?;
        handled += 1;
    }

    info!(handled, "Input closed, worker exiting");
    Ok(handled)
}

/// Encode a reply, falling back to an error reply when the output itself
/// cannot be serialized.
fn encode_reply<J: RemoteJob>(
    id: uuid::Uuid,
    outcome: Result<J::Output, WireError>,
) -> AlignResult<String> {
    match encode_line(&Response { id, outcome }, "encoding job output") {
        Ok(line) => Ok(line),
        Err(err) => encode_line(
            &Response::<J::Output> {
                id,
                outcome: Err(WireError::from(&err)),
            },
            "encoding reply",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::{Deserialize, Serialize};
    use std::io::Cursor;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct Double(i64);

    impl RemoteJob for Double {
        type Output = i64;
        const NAME: &'static str = "double";
    }

    fn request_line(id: Uuid, value: i64) -> String {
        encode_line(&Request { id, job: Double(value) }, "test").unwrap()
    }

    fn replies(output: Vec<u8>) -> Vec<Response<i64>> {
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| decode_line(l, "test").unwrap())
            .collect()
    }

    #[test]
    fn test_each_request_gets_matching_reply() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let input = format!("{}\n{}", request_line(a, 2), request_line(b, -4));
        let mut output = Vec::new();

        let handled = serve(Cursor::new(input), &mut output, |job: Double| Ok(job.0 * 2)).unwrap();

        assert_eq!(handled, 2);
        let replies = replies(output);
        assert_eq!(replies[0].id, a);
        assert_eq!(replies[0].outcome, Ok(4));
        assert_eq!(replies[1].id, b);
        assert_eq!(replies[1].outcome, Ok(-8));
    }

    #[test]
    fn test_handler_error_is_replied_and_loop_continues() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let input = request_line(a, 0) + &request_line(b, 1);
        let mut output = Vec::new();

        serve(Cursor::new(input), &mut output, |job: Double| {
            if job.0 == 0 {
                Err(AlignError::alignment("zero"))
            } else {
                Ok(job.0)
            }
        })
        .unwrap();

        let replies = replies(output);
        assert_eq!(replies[0].outcome.as_ref().unwrap_err().kind, ErrorKind::Alignment);
        assert_eq!(replies[1].outcome, Ok(1));
    }

    #[test]
    fn test_undecodable_job_with_id_gets_serialization_error() {
        let id = Uuid::new_v4();
        let input = format!("{{\"id\":\"{}\",\"job\":\"not a number\"}}\n", id);
        let mut output = Vec::new();

        serve(Cursor::new(input), &mut output, |job: Double| Ok(job.0)).unwrap();

        let replies = replies(output);
        assert_eq!(replies[0].id, id);
        assert_eq!(replies[0].outcome.as_ref().unwrap_err().kind, ErrorKind::Serialization);
    }

    #[test]
    fn test_line_without_id_stops_the_worker() {
        let mut output = Vec::new();
        let err = serve(Cursor::new("garbage\n"), &mut output, |job: Double| Ok(job.0)).unwrap_err();
        assert!(matches!(err, AlignError::Serialization { .. }));
        assert!(output.is_empty());
    }
}
