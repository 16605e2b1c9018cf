/*!
`amqp.rs`

Implements the `tsu amqp` task: publish one message to a topic exchange and
await exactly one reply on an ephemeral exclusive reply queue.

Protocol sequence (ordering is a correctness requirement):
  1. connect to amqp://{host}:{port}
  2. open a channel
  3. declare the target exchange (topic, durable=false; idempotent)
  4. declare an anonymous exclusive reply queue (server-named, unbound)
  5. register the reply-queue consumer
  6. publish with reply-to = reply queue name
  7. first delivery: format, close the connection once, print

Step 5 completes before step 6 is issued, so a reply can never be lost to a
publish/consume registration race. Each step is awaited before the next one
starts.

Failure in steps 1-6 aborts with the error and exit 1; the connection is not
closed in that case and no retry is attempted. There is no timeout on the
reply wait: a silent responder hangs the invocation until the process is
killed externally.

The sequence runs against the small `ReplyBroker` seam; `LapinBroker` is the
production implementation and tests drive the same code with a recording fake.
*/

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};

use crate::cmd::format;
use crate::cmd::shared;
use crate::log_debug;

/* -------------------------------------------------------------------------- */
/* Argument Struct                                                            */
/* -------------------------------------------------------------------------- */

#[derive(Args, Debug)]
pub struct AmqpArgs {
    /// Message to publish (literal; --file takes precedence)
    #[arg(value_name = "MESSAGE")]
    pub message: Option<String>,

    /// Exchange to publish to (declared as topic, non-durable)
    #[arg(short = 'e', long, value_name = "NAME")]
    pub exchange: Option<String>,

    /// Routing key for the published message
    #[arg(short = 'k', long = "routing-key", value_name = "KEY")]
    pub routing_key: Option<String>,

    /// Broker host
    #[arg(short = 'H', long, default_value = "localhost")]
    pub host: String,

    /// Broker port
    #[arg(short = 'p', long, default_value_t = 5672)]
    pub port: u16,

    /// Read the message from a file (takes precedence over the literal)
    #[arg(short = 'f', long, value_name = "PATH")]
    pub file: Option<String>,

    /// Render the reply as pretty JSON regardless of its content type
    #[arg(long)]
    pub json: bool,

    /// Announce the publish and log protocol steps
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/* -------------------------------------------------------------------------- */
/* Broker Seam                                                                */
/* -------------------------------------------------------------------------- */

/// A reply delivered on the reply queue.
#[derive(Debug)]
pub struct Reply {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// The broker-side operations one request/reply cycle needs, in the order it
/// needs them. Kept as a seam so the ordering contract can be exercised
/// without a live broker.
#[allow(async_fn_in_trait)]
pub trait ReplyBroker {
    async fn declare_exchange(&mut self, name: &str) -> Result<()>;
    /// Declare the anonymous exclusive reply queue; returns its server name.
    async fn declare_reply_queue(&mut self) -> Result<String>;
    async fn start_consuming(&mut self, queue: &str) -> Result<()>;
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        reply_to: &str,
    ) -> Result<()>;
    async fn next_reply(&mut self) -> Result<Reply>;
    async fn close(&mut self) -> Result<()>;
}

/// Run the publish-then-await-one-reply cycle and return the formatted reply.
///
/// The consumer is registered before the publish goes out; otherwise a fast
/// responder could reply into a queue nobody is reading yet. The connection
/// is closed exactly once after the reply arrives, whether or not the reply
/// body formats cleanly.
pub async fn run_request_reply<B: ReplyBroker>(
    broker: &mut B,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
    verbose: bool,
    force_json: bool,
) -> Result<String> {
    broker.declare_exchange(exchange).await?;
    let reply_queue = broker.declare_reply_queue().await?;
    broker.start_consuming(&reply_queue).await?;
    broker
        .publish(exchange, routing_key, payload, &reply_queue)
        .await?;

    // Announced only after the broker accepted the publish.
    if verbose {
        println!(
            "Sending message to '{}' with routing key '{}':\n'{}'",
            exchange,
            routing_key,
            String::from_utf8_lossy(payload)
        );
    }

    let reply = broker.next_reply().await?;
    let rendered = format::format_body(&reply.body, reply.content_type.as_deref(), force_json);
    broker.close().await?;
    rendered
}

/* -------------------------------------------------------------------------- */
/* Lapin Implementation                                                       */
/* -------------------------------------------------------------------------- */

/// Production `ReplyBroker` over a single lapin connection/channel pair.
pub struct LapinBroker {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

impl LapinBroker {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let uri = format!("amqp://{host}:{port}");
        log_debug!("connecting to {uri}");
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .with_context(|| format!("Failed to connect to {uri}"))?;
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open channel")?;
        Ok(Self {
            connection,
            channel,
            consumer: None,
        })
    }
}

impl ReplyBroker for LapinBroker {
    async fn declare_exchange(&mut self, name: &str) -> Result<()> {
        log_debug!("declaring topic exchange '{name}'");
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: false,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange '{name}'"))
    }

    async fn declare_reply_queue(&mut self) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to declare reply queue")?;
        let name = queue.name().as_str().to_string();
        log_debug!("reply queue '{name}' declared");
        Ok(name)
    }

    async fn start_consuming(&mut self, queue: &str) -> Result<()> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "tsu-reply",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to consume from reply queue '{queue}'"))?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        reply_to: &str,
    ) -> Result<()> {
        let properties = BasicProperties::default().with_reply_to(reply_to.to_string().into());
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .context("Failed to publish message")?
            .await
            .context("Publish was not accepted by the broker")?;
        Ok(())
    }

    async fn next_reply(&mut self) -> Result<Reply> {
        let consumer = self
            .consumer
            .as_mut()
            .context("Reply consumer is not registered")?;
        // No timeout: a non-responding consumer hangs here until the process
        // is killed.
        let delivery = consumer
            .next()
            .await
            .context("Reply stream closed before a reply arrived")??;
        let content_type = delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string());
        Ok(Reply {
            body: delivery.data,
            content_type,
        })
    }

    async fn close(&mut self) -> Result<()> {
        log_debug!("closing connection");
        self.connection
            .close(0, "")
            .await
            .context("Failed to close connection")
    }
}

/* -------------------------------------------------------------------------- */
/* Public Entry Point                                                         */
/* -------------------------------------------------------------------------- */

pub fn execute_amqp(args: AmqpArgs) -> Result<()> {
    crate::utils::init_logging(crate::utils::derive_level(args.verbose));

    let mut errors = Vec::new();
    shared::check_required(args.exchange.as_deref(), "Exchange name", &mut errors);
    shared::check_required(args.routing_key.as_deref(), "Routing key", &mut errors);
    if args.file.is_none() {
        shared::check_required(args.message.as_deref(), "Message", &mut errors);
    }
    if !errors.is_empty() {
        println!("{}", shared::render_invalid_options(&errors));
        std::process::exit(1);
    }

    let exchange = args.exchange.clone().unwrap_or_default();
    let routing_key = args.routing_key.clone().unwrap_or_default();

    // Message file is read before the broker is contacted.
    let Some(payload) = shared::resolve_payload(args.file.as_deref(), args.message.as_deref())?
    else {
        anyhow::bail!("Message is required");
    };

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let rendered = rt.block_on(async {
        let mut broker = LapinBroker::connect(&args.host, args.port).await?;
        run_request_reply(
            &mut broker,
            &exchange,
            &routing_key,
            &payload,
            args.verbose,
            args.json,
        )
        .await
    })?;

    println!("\nResponse:\n{rendered}");
    Ok(())
}

/* -------------------------------------------------------------------------- */
/* Tests                                                                      */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeBroker {
        calls: Vec<String>,
        closes: usize,
        fail_exchange_declare: bool,
        fail_consume: bool,
        reply: Option<Reply>,
    }

    impl FakeBroker {
        fn echoing(body: &[u8], content_type: Option<&str>) -> Self {
            FakeBroker {
                reply: Some(Reply {
                    body: body.to_vec(),
                    content_type: content_type.map(str::to_string),
                }),
                ..FakeBroker::default()
            }
        }

        fn index_of(&self, prefix: &str) -> usize {
            self.calls
                .iter()
                .position(|c| c.starts_with(prefix))
                .unwrap_or_else(|| panic!("no call starting with '{prefix}': {:?}", self.calls))
        }
    }

    impl ReplyBroker for FakeBroker {
        async fn declare_exchange(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("declare_exchange:{name}"));
            if self.fail_exchange_declare {
                anyhow::bail!("exchange declare refused");
            }
            Ok(())
        }

        async fn declare_reply_queue(&mut self) -> Result<String> {
            self.calls.push("declare_reply_queue".to_string());
            Ok("amq.gen-fake".to_string())
        }

        async fn start_consuming(&mut self, queue: &str) -> Result<()> {
            self.calls.push(format!("consume:{queue}"));
            if self.fail_consume {
                anyhow::bail!("consume refused");
            }
            Ok(())
        }

        async fn publish(
            &mut self,
            exchange: &str,
            routing_key: &str,
            _payload: &[u8],
            reply_to: &str,
        ) -> Result<()> {
            self.calls
                .push(format!("publish:{exchange}:{routing_key}:{reply_to}"));
            Ok(())
        }

        async fn next_reply(&mut self) -> Result<Reply> {
            self.calls.push("next_reply".to_string());
            self.reply.take().context("no reply queued")
        }

        async fn close(&mut self) -> Result<()> {
            self.closes += 1;
            self.calls.push("close".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn consumer_registered_before_publish() {
        let mut broker = FakeBroker::echoing(b"pong", None);
        run_request_reply(&mut broker, "orders", "order.created", b"ping", false, false)
            .await
            .unwrap();

        assert!(broker.index_of("declare_exchange:orders") < broker.index_of("consume:"));
        assert!(broker.index_of("consume:") < broker.index_of("publish:"));
        assert!(broker.index_of("publish:") < broker.index_of("next_reply"));
    }

    #[tokio::test]
    async fn publish_carries_reply_queue_name() {
        let mut broker = FakeBroker::echoing(b"pong", None);
        run_request_reply(&mut broker, "orders", "order.created", b"ping", false, false)
            .await
            .unwrap();

        assert!(
            broker
                .calls
                .contains(&"publish:orders:order.created:amq.gen-fake".to_string())
        );
    }

    #[tokio::test]
    async fn exactly_one_close_on_success() {
        let mut broker = FakeBroker::echoing(b"pong", None);
        run_request_reply(&mut broker, "orders", "k", b"ping", false, false)
            .await
            .unwrap();
        assert_eq!(broker.closes, 1);
    }

    #[tokio::test]
    async fn no_close_when_exchange_declare_fails() {
        let mut broker = FakeBroker {
            fail_exchange_declare: true,
            ..FakeBroker::default()
        };
        let err = run_request_reply(&mut broker, "orders", "k", b"ping", false, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exchange declare refused"));
        assert_eq!(broker.closes, 0);
    }

    #[tokio::test]
    async fn no_close_when_consume_fails() {
        let mut broker = FakeBroker {
            fail_consume: true,
            ..FakeBroker::default()
        };
        assert!(
            run_request_reply(&mut broker, "orders", "k", b"ping", false, false)
                .await
                .is_err()
        );
        assert_eq!(broker.closes, 0);
        // A failed consume registration must prevent the publish.
        assert!(!broker.calls.iter().any(|c| c.starts_with("publish:")));
    }

    #[tokio::test]
    async fn echoed_reply_is_returned_raw_without_content_type() {
        let mut broker = FakeBroker::echoing(br#"{"id":1}"#, None);
        let out = run_request_reply(&mut broker, "orders", "order.created", b"x", false, false)
            .await
            .unwrap();
        assert_eq!(out, r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn json_flag_forces_pretty_rendering() {
        let mut broker = FakeBroker::echoing(br#"{"id":1}"#, None);
        let out = run_request_reply(&mut broker, "orders", "k", b"x", false, true)
            .await
            .unwrap();
        assert_eq!(out, "{\n  \"id\": 1\n}");
    }

    #[tokio::test]
    async fn json_flag_on_non_json_reply_fails_and_still_closes() {
        let mut broker = FakeBroker::echoing(b"not json", None);
        let err = run_request_reply(&mut broker, "orders", "k", b"x", false, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
        assert_eq!(broker.closes, 1);
    }

    #[tokio::test]
    async fn reply_content_type_drives_rendering() {
        let mut broker = FakeBroker::echoing(br#"{"id":1}"#, Some("application/json"));
        let out = run_request_reply(&mut broker, "orders", "k", b"x", false, false)
            .await
            .unwrap();
        assert_eq!(out, "{\n  \"id\": 1\n}");
    }
}
