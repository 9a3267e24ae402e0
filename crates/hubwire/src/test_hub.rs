//! The `/test` hub served by `hubwire serve`.
//!
//! Client libraries run their integration suites against it, so the method
//! names and reply shapes are fixed.

use std::time::Duration;

use futures_util::{StreamExt, stream};

use hubwire_server::{
    Arguments, HubContext, HubError, HubMethodTable, HubValue, ItemStream, ParamKind,
};

/// Path the test hub is mounted at.
pub const TEST_HUB_PATH: &str = "/test";

/// Builds the test hub's method table.
pub fn methods() -> HubMethodTable {
    HubMethodTable::new()
        .method("Echo", &[ParamKind::Any, ParamKind::Any], |ctx, args| async move {
            ctx.clients()
                .caller()
                .send("EchoBack", args.into_values())
                .await;
            Ok(None)
        })
        .method(
            "Invoke",
            &[ParamKind::Any, ParamKind::Any],
            |_ctx, args| async move { Ok(args.value(1).cloned()) },
        )
        .method("InvokeWithoutReturn", &[ParamKind::Any], |_ctx, _args| async move {
            Ok(None)
        })
        .method(
            "InvokeWithClientResult",
            &[ParamKind::String],
            |ctx, args| async move {
                let result = ctx.invoke_caller("ClientResult", args.into_values()).await?;
                ctx.clients()
                    .caller()
                    .send("EchoBack", vec![result.clone()])
                    .await;
                Ok(Some(result))
            },
        )
        .method(
            "InvokeWithEmptyClientResult",
            &[ParamKind::String],
            |ctx, args| async move {
                let result = ctx.invoke_caller("ClientResult", args.into_values()).await?;
                if !result.is_null() {
                    return Err(HubError::hub("Expected an empty client result."));
                }
                ctx.clients()
                    .caller()
                    .send("EchoBack", [HubValue::from("received")])
                    .await;
                Ok(None)
            },
        )
        .stream("Stream", &[], |_ctx, _args| {
            stream::iter(["a", "b", "c"].map(|item| Ok(HubValue::from(item))))
        })
        .stream("Counter", &[ParamKind::Integer, ParamKind::Integer], counter)
        .method(
            "AddNumbers",
            &[ParamKind::Integer, ParamKind::Stream],
            |_ctx, mut args| async move {
                let mut total: i64 = args.get(0)?;
                let mut numbers = args.stream(0)?;
                while let Some(item) = numbers.next().await {
                    total += integer(&item?)?;
                }
                Ok(Some(HubValue::from(total)))
            },
        )
        .stream("Count", &[ParamKind::Integer, ParamKind::Stream], count_uploads)
        .method("JoinGroup", &[ParamKind::String], |ctx, args| async move {
            let group: String = args.get(0)?;
            ctx.groups().join(&group).await;
            Ok(None)
        })
        .method("LeaveGroup", &[ParamKind::String], |ctx, args| async move {
            let group: String = args.get(0)?;
            ctx.groups().leave(&group).await;
            Ok(None)
        })
        .method(
            "BroadcastToGroup",
            &[ParamKind::String, ParamKind::Any],
            |ctx, args| async move {
                let group: String = args.get(0)?;
                let message = args.value(1).cloned().unwrap_or_default();
                ctx.clients()
                    .group(group)
                    .send("Receive", vec![message])
                    .await;
                Ok(None)
            },
        )
        .method("Broadcast", &[ParamKind::Any], |ctx, args| async move {
            ctx.clients().all().send("Receive", args.into_values()).await;
            Ok(None)
        })
}

/// Streams `1..=count`, pausing `delay_ms` between items.
fn counter(_ctx: HubContext, args: Arguments) -> ItemStream {
    let bounds = args
        .get::<u64>(0)
        .and_then(|count| Ok((count, args.get::<u64>(1)?)));
    let (count, delay_ms) = match bounds {
        Ok(bounds) => bounds,
        Err(e) => return stream::once(async move { Err(e) }).boxed(),
    };

    stream::unfold(1u64, move |next| async move {
        if next > count {
            return None;
        }
        if next > 1 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        Some((Ok(HubValue::from(next)), next + 1))
    })
    .boxed()
}

/// Yields `start + n` for the nth item the client uploads.
fn count_uploads(_ctx: HubContext, mut args: Arguments) -> ItemStream {
    let bound = args
        .get::<i64>(0)
        .and_then(|start| Ok((start, args.stream(0)?)));
    let (start, uploads) = match bound {
        Ok(bound) => bound,
        Err(e) => return stream::once(async move { Err(e) }).boxed(),
    };

    uploads
        .enumerate()
        .map(move |(n, item)| item.map(|_| HubValue::from(start + n as i64 + 1)))
        .boxed()
}

fn integer(value: &HubValue) -> Result<i64, HubError> {
    value
        .as_i64()
        .ok_or_else(|| HubError::invalid_arguments("stream items must be integers"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Arc;

    use hubwire_protocol::{
        Completion, FrameBuffer, HandshakeRequest, HandshakeResponse, HubMessage, HubProtocol,
        Invocation, StreamItem, encode_handshake_request, parse_handshake_response,
    };
    use hubwire_server::{Dispatcher, ServerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct Client {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        buffer: FrameBuffer,
        protocol: HubProtocol,
    }

    impl Client {
        async fn connect(dispatcher: &Arc<Dispatcher>) -> Self {
            Self::connect_with(dispatcher, HubProtocol::Json).await
        }

        async fn connect_with(dispatcher: &Arc<Dispatcher>, protocol: HubProtocol) -> Self {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let server_side = dispatcher.clone();
            tokio::spawn(async move {
                let _ = server_side.serve_stream(TEST_HUB_PATH, server).await;
            });
            let (mut reader, mut writer) = tokio::io::split(client);
            let request = encode_handshake_request(&HandshakeRequest::new(protocol)).unwrap();
            writer.write_all(&request).await.unwrap();

            let mut received = Vec::new();
            let mut chunk = [0u8; 1024];
            let leftover = loop {
                if let Some((response, used)) =
                    parse_handshake_response(&received, 4096).unwrap()
                {
                    assert_eq!(response, HandshakeResponse::accepted());
                    break received.split_off(used);
                }
                let n = reader.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed during handshake");
                received.extend_from_slice(&chunk[..n]);
            };

            let mut buffer = FrameBuffer::new(protocol);
            buffer.push(&leftover);
            Self {
                reader,
                writer,
                buffer,
                protocol,
            }
        }

        async fn send(&mut self, message: HubMessage) {
            let frame = self.protocol.encode(&message).unwrap();
            self.writer.write_all(&frame).await.unwrap();
        }

        async fn invoke(&mut self, id: &str, target: &str, arguments: Vec<Value>) {
            self.send(HubMessage::Invocation(Invocation::new(id, target, arguments)))
                .await;
        }

        async fn recv(&mut self) -> HubMessage {
            let mut chunk = [0u8; 4096];
            loop {
                match self.buffer.next_message().unwrap() {
                    Some(HubMessage::Ping) => continue,
                    Some(message) => return message,
                    None => {}
                }
                let n = tokio::time::timeout(Duration::from_secs(5), self.reader.read(&mut chunk))
                    .await
                    .expect("timed out waiting for the server")
                    .unwrap();
                assert!(n > 0, "server closed the connection");
                self.buffer.push(&chunk[..n]);
            }
        }

        /// Next fire-and-forget call from the server, as `(target, arguments)`.
        async fn recv_call(&mut self) -> (String, Vec<Value>) {
            match self.recv().await {
                HubMessage::Invocation(inv) if inv.invocation_id.is_none() => {
                    (inv.target, inv.arguments.iter().map(HubValue::to_json).collect())
                }
                other => panic!("expected client call, got {other:?}"),
            }
        }

        async fn completion(&mut self) -> Completion {
            match self.recv().await {
                HubMessage::Completion(completion) => completion,
                other => panic!("expected completion, got {other:?}"),
            }
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let mut dispatcher = Dispatcher::new(ServerConfig::default());
        dispatcher.register_hub(TEST_HUB_PATH, methods()).unwrap();
        Arc::new(dispatcher)
    }

    async fn wait_for_connections(dispatcher: &Dispatcher, expected: usize) {
        for _ in 0..200 {
            if dispatcher.connection_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} connections");
    }

    #[test]
    fn method_surface() {
        insta::assert_debug_snapshot!(methods().names(), @r#"
        [
            "AddNumbers",
            "Broadcast",
            "BroadcastToGroup",
            "Count",
            "Counter",
            "Echo",
            "Invoke",
            "InvokeWithClientResult",
            "InvokeWithEmptyClientResult",
            "InvokeWithoutReturn",
            "JoinGroup",
            "LeaveGroup",
            "Stream",
        ]
        "#);
    }

    #[tokio::test]
    async fn echo_sends_echo_back() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .send(HubMessage::client_call("Echo", vec![json!("hello"), json!(42)]))
            .await;
        assert_eq!(
            client.recv_call().await,
            ("EchoBack".to_string(), vec![json!("hello"), json!(42)])
        );
    }

    #[tokio::test]
    async fn invoke_returns_second_argument() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .invoke("1", "Invoke", vec![json!("ignored"), json!({"n": 1})])
            .await;
        assert_eq!(client.completion().await, Completion::result("1", json!({"n": 1})));

        client
            .invoke("2", "InvokeWithoutReturn", vec![json!("x")])
            .await;
        assert_eq!(client.completion().await, Completion::void("2"));
    }

    #[tokio::test]
    async fn stream_yields_letters() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .send(HubMessage::Invocation(Invocation::streaming(
                "s",
                "Stream",
                Vec::<HubValue>::new(),
            )))
            .await;
        for letter in ["a", "b", "c"] {
            assert_eq!(
                client.recv().await,
                HubMessage::StreamItem(StreamItem::new("s", json!(letter)))
            );
        }
        assert_eq!(client.completion().await, Completion::void("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn counter_streams_in_order() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .send(HubMessage::Invocation(Invocation::streaming(
                "c",
                "Counter",
                vec![json!(3), json!(100)],
            )))
            .await;
        for n in 1..=3 {
            assert_eq!(
                client.recv().await,
                HubMessage::StreamItem(StreamItem::new("c", json!(n)))
            );
        }
        assert_eq!(client.completion().await, Completion::void("c"));
    }

    #[tokio::test]
    async fn add_numbers_sums_uploaded_stream() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .send(HubMessage::Invocation(
                Invocation::new("1", "AddNumbers", vec![json!(10)]).with_stream_ids(["0"]),
            ))
            .await;
        for n in 0..=5 {
            client
                .send(HubMessage::StreamItem(StreamItem::new("0", json!(n))))
                .await;
        }
        client.send(HubMessage::Completion(Completion::void("0"))).await;

        assert_eq!(client.completion().await, Completion::result("1", json!(25)));
    }

    #[tokio::test]
    async fn count_answers_each_uploaded_item() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .send(HubMessage::Invocation(
                Invocation::streaming("c", "Count", vec![json!(10)]).with_stream_ids(["0"]),
            ))
            .await;
        for n in 0..=5 {
            client
                .send(HubMessage::StreamItem(StreamItem::new("0", json!(n))))
                .await;
            assert_eq!(
                client.recv().await,
                HubMessage::StreamItem(StreamItem::new("c", json!(11 + n)))
            );
        }
        client.send(HubMessage::Completion(Completion::void("0"))).await;
        assert_eq!(client.completion().await, Completion::void("c"));
    }

    #[tokio::test]
    async fn upload_without_stream_id_is_rejected() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client.invoke("1", "AddNumbers", vec![json!(10), json!(5)]).await;
        let completion = client.completion().await;
        insta::assert_snapshot!(completion.error_message().unwrap(), @"Failed to invoke 'AddNumbers': Client sent 0 stream(s), Hub method expects 1.");
    }

    #[tokio::test]
    async fn messagepack_echo_keeps_binary_and_float32() {
        let dispatcher = dispatcher();
        let mut client = Client::connect_with(&dispatcher, HubProtocol::MessagePack).await;

        let arguments = vec![
            HubValue::binary(b"ab".to_vec()),
            HubValue::from(rmpv::Value::F32(1.5)),
        ];
        client
            .send(HubMessage::client_call("Echo", arguments.clone()))
            .await;
        match client.recv().await {
            HubMessage::Invocation(inv) => {
                assert_eq!(inv.target, "EchoBack");
                assert_eq!(inv.arguments, arguments);
            }
            other => panic!("expected client call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn counter_rejects_negative_count() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .send(HubMessage::Invocation(Invocation::streaming(
                "c",
                "Counter",
                vec![json!(-1), json!(0)],
            )))
            .await;
        assert!(client.completion().await.is_error());
    }

    #[tokio::test]
    async fn client_result_is_echoed_and_returned() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        client
            .invoke("1", "InvokeWithClientResult", vec![json!("Hello, World!")])
            .await;

        let request = match client.recv().await {
            HubMessage::Invocation(inv) => inv,
            other => panic!("expected client result request, got {other:?}"),
        };
        assert_eq!(request.target, "ClientResult");
        assert_eq!(request.arguments, vec![json!("Hello, World!")]);
        let id = request.invocation_id.expect("client results carry an id");
        client
            .send(HubMessage::Completion(Completion::result(
                id,
                json!("Hello, World!"),
            )))
            .await;

        assert_eq!(
            client.recv_call().await,
            ("EchoBack".to_string(), vec![json!("Hello, World!")])
        );
        assert_eq!(
            client.completion().await,
            Completion::result("1", json!("Hello, World!"))
        );
    }

    #[tokio::test]
    async fn empty_client_result_is_acknowledged() {
        let dispatcher = dispatcher();
        let mut client = Client::connect(&dispatcher).await;

        // Method lookup ignores case.
        client
            .invoke("1", "invokeWithEmptyClientResult", vec![json!("Hello")])
            .await;
        let id = match client.recv().await {
            HubMessage::Invocation(inv) => inv.invocation_id.expect("client results carry an id"),
            other => panic!("expected client result request, got {other:?}"),
        };
        client.send(HubMessage::Completion(Completion::void(id))).await;

        assert_eq!(
            client.recv_call().await,
            ("EchoBack".to_string(), vec![json!("received")])
        );
        assert_eq!(client.completion().await, Completion::void("1"));
    }

    #[tokio::test]
    async fn group_and_broadcast_delivery() {
        let dispatcher = dispatcher();
        let mut member = Client::connect(&dispatcher).await;
        let mut outsider = Client::connect(&dispatcher).await;
        wait_for_connections(&dispatcher, 2).await;

        member.invoke("1", "JoinGroup", vec![json!("room")]).await;
        assert_eq!(member.completion().await, Completion::void("1"));

        outsider
            .invoke("1", "BroadcastToGroup", vec![json!("room"), json!("hi room")])
            .await;
        assert_eq!(outsider.completion().await, Completion::void("1"));
        assert_eq!(
            member.recv_call().await,
            ("Receive".to_string(), vec![json!("hi room")])
        );

        member.invoke("2", "LeaveGroup", vec![json!("room")]).await;
        assert_eq!(member.completion().await, Completion::void("2"));
        assert!(
            dispatcher
                .group_members(TEST_HUB_PATH, "room")
                .await
                .unwrap()
                .is_empty()
        );

        outsider.invoke("2", "Broadcast", vec![json!("hi all")]).await;
        assert_eq!(
            member.recv_call().await,
            ("Receive".to_string(), vec![json!("hi all")])
        );
        assert_eq!(
            outsider.recv_call().await,
            ("Receive".to_string(), vec![json!("hi all")])
        );
        assert_eq!(outsider.completion().await, Completion::void("2"));
    }
}
