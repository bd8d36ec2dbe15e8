//! AMQP 0-9-1 link backed by `lapin`.
//!
//! ## Concurrency model
//!
//! A single background actor task owns the AMQP connection and channel. Every
//! declare, publish, ack and consume request is sent to it as a [`Cmd`] and
//! answered on a oneshot, so no other task touches the connection. Each
//! `basic_consume` gets its own task that decodes deliveries and forwards them
//! to the subscriber's inbox.
//!
//! ## Wire format
//!
//! Messages travel as JSON-encoded [`Message`] bodies on the default exchange
//! with the routing key set to the destination queue name. Correlation id,
//! reply-to and content type are mirrored into the AMQP properties for the
//! benefit of other clients on the same broker.
//!
//! ## Failure detection
//!
//! A connection error reported by lapin, or a consumer stream ending with an
//! error, flips the link's closed signal. The [`ConnectionManager`] watching
//! that signal takes care of reconnecting.
//!
//! [`ConnectionManager`]: crate::ConnectionManager

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerUrl,
    Connector,
    Delivery,
    DeliveryTag,
    Link,
    LinkPtr,
    Message,
    QueueOptions,
    Result,
    RpcError,
    Scheme,
    SubscriptionHandle,
    CONTENT_TYPE_JSON,
};

fn declare_options(options: QueueOptions) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: false,
        durable: options.durable,
        exclusive: false,
        auto_delete: options.auto_delete,
        nowait: false,
    }
}

//
// Actor commands
//

enum Cmd {
    //
    Declare {
        queue: String,
        options: QueueOptions,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        msg: Message,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        queue: String,
        inbox: mpsc::UnboundedSender<Delivery>,
        resp: oneshot::Sender<Result<()>>,
    },
    Ack {
        tag: DeliveryTag,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Opens lapin connections for `amqp://` and `amqps://` URLs.
pub struct AmqpConnector {
    // ---
    prefetch: u16,
    next_id: AtomicU64,
}

impl AmqpConnector {
    /// `prefetch` bounds unacknowledged deliveries per channel (`basic.qos`).
    pub fn new(prefetch: u16) -> Self {
        Self {
            prefetch,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait::async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &BrokerUrl) -> Result<LinkPtr> {
        // ---
        if url.scheme() == Scheme::Memory {
            return Err(RpcError::Connection(format!(
                "amqp connector cannot open {url}"
            )));
        }

        let link_id = format!(
            "amqp-{}-{}",
            url.authority(),
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );

        log_info!("[{link_id}] connecting to AMQP broker {url}");

        let connection = Connection::connect(url.as_str(), ConnectionProperties::default())
            .await
            .map_err(|e| {
                let msg = format!("amqp: connection failed: {e}");
                log_error!("[{link_id}] {msg}");
                RpcError::Connection(msg)
            })?;

        let channel = connection.create_channel().await.map_err(|e| {
            let msg = format!("amqp: channel creation failed: {e}");
            log_error!("[{link_id}] {msg}");
            RpcError::Connection(msg)
        })?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| RpcError::Connection(format!("amqp: basic.qos failed: {e}")))?;

        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        {
            let closed_tx = Arc::clone(&closed_tx);
            let link_id = link_id.clone();
            connection.on_error(move |e| {
                log_warn!("[{link_id}] connection error: {e}");
                closed_tx.send_replace(true);
            });
        }

        log_info!("[{link_id}] connected, prefetch {}", self.prefetch);

        Ok(AmqpLink::create(link_id, connection, channel, closed_tx))
    }
}

/// One lapin connection plus channel, driven by an actor task.
struct AmqpLink {
    // ---
    link_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl AmqpLink {
    fn create(
        link_id: String,
        connection: Connection,
        channel: Channel,
        closed_tx: Arc<watch::Sender<bool>>,
    ) -> LinkPtr {
        // ---
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = Actor {
            link_id: link_id.clone(),
            connection,
            channel,
            cmd_rx,
            closed_tx: Arc::clone(&closed_tx),
            consumers: Vec::new(),
        };
        tokio::spawn(actor.run());

        Arc::new(Self {
            link_id,
            cmd_tx,
            closed_tx,
        })
    }

    async fn call<F>(&self, make: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Cmd,
    {
        // ---
        if *self.closed_tx.borrow() {
            return Err(RpcError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RpcError::NotConnected)?;

        rx.await.map_err(|_| RpcError::NotConnected)?
    }
}

#[async_trait::async_trait]
impl Link for AmqpLink {
    fn link_id(&self) -> &str {
        &self.link_id
    }

    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        let queue = queue.to_string();
        self.call(|resp| Cmd::Declare {
            queue,
            options,
            resp,
        })
        .await
    }

    async fn publish(&self, msg: Message) -> Result<()> {
        self.call(|resp| Cmd::Publish { msg, resp }).await
    }

    async fn subscribe(&self, queue: &str) -> Result<SubscriptionHandle> {
        // ---
        let (inbox, rx) = mpsc::unbounded_channel();
        let queue = queue.to_string();
        self.call(|resp| Cmd::Subscribe { queue, inbox, resp }).await?;
        Ok(SubscriptionHandle { inbox: rx })
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.call(|resp| Cmd::Ack { tag, resp }).await
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

/// Background task owning the AMQP connection and channel.
struct Actor {
    // ---
    link_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    closed_tx: Arc<watch::Sender<bool>>,
    consumers: Vec<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] AMQP actor started", self.link_id);

        let mut closed_rx = self.closed_tx.subscribe();
        let mut close_resp = None;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::Close { resp }) => {
                        close_resp = Some(resp);
                        break;
                    }
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                },
                _ = crate::connection::wait_until_set(&mut closed_rx) => {
                    log_warn!("[{}] link lost", self.link_id);
                    break;
                }
            }
        }

        for handle in self.consumers.drain(..) {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;
        self.closed_tx.send_replace(true);

        if let Some(resp) = close_resp {
            let _ = resp.send(Ok(()));
        }

        log_info!("[{}] AMQP actor stopped", self.link_id);
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Declare {
                queue,
                options,
                resp,
            } => {
                let _ = resp.send(self.do_declare(&queue, options).await);
            }
            Cmd::Publish { msg, resp } => {
                let _ = resp.send(self.do_publish(msg).await);
            }
            Cmd::Subscribe { queue, inbox, resp } => {
                let _ = resp.send(self.do_subscribe(queue, inbox).await);
            }
            Cmd::Ack { tag, resp } => {
                let result = self
                    .channel
                    .basic_ack(tag, BasicAckOptions::default())
                    .await
                    .map_err(|e| RpcError::Transport(format!("amqp: ack failed: {e}")));
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
            }
        }
    }

    async fn do_declare(&mut self, queue: &str, options: QueueOptions) -> Result<()> {
        // ---
        self.channel
            .queue_declare(queue.into(), declare_options(options), FieldTable::default())
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: queue declare failed: {e}")))?;

        log_debug!(
            "[{}] declared queue {queue} (durable: {}, auto_delete: {})",
            self.link_id,
            options.durable,
            options.auto_delete
        );
        Ok(())
    }

    async fn do_publish(&mut self, msg: Message) -> Result<()> {
        // ---
        let queue = msg.address().as_str().to_string();
        let payload = serde_json::to_vec(&msg)?;

        let mut properties = BasicProperties::default()
            .with_content_type(msg.content_type().unwrap_or(CONTENT_TYPE_JSON).into());
        if let Some(id) = msg.correlation_id() {
            properties = properties.with_correlation_id(id.as_str().into());
        }
        if let Some(reply_to) = msg.reply_to() {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }

        self.channel
            .basic_publish(
                "".into(),             // default exchange
                queue.as_str().into(), // routing key = queue name
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: publish failed: {e}")))?;

        log_debug!("[{}] published to {queue}", self.link_id);
        Ok(())
    }

    async fn do_subscribe(&mut self, queue: String, inbox: mpsc::UnboundedSender<Delivery>) -> Result<()> {
        // ---
        let consumer_tag = format!("{}-{}-{}", self.link_id, queue, self.consumers.len());

        let consumer = self
            .channel
            .basic_consume(
                queue.as_str().into(),
                consumer_tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Transport(format!("amqp: consume failed: {e}")))?;

        log_info!("[{}] consuming {queue}", self.link_id);

        let link_id = self.link_id.clone();
        let channel = self.channel.clone();
        let closed_tx = Arc::clone(&self.closed_tx);

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                let delivery = match delivery_result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        log_error!("[{link_id}] consumer error on {queue}: {e}");
                        closed_tx.send_replace(true);
                        break;
                    }
                };

                let tag = delivery.delivery_tag;
                let message: Message = match serde_json::from_slice(&delivery.data) {
                    Ok(message) => message,
                    Err(e) => {
                        // Undecodable bodies would be redelivered forever.
                        log_error!("[{link_id}] dropping undecodable message on {queue}: {e}");
                        let _ = channel.basic_ack(tag, BasicAckOptions::default()).await;
                        continue;
                    }
                };

                if inbox.send(Delivery { tag, message }).is_err() {
                    // Stop the broker pushing more; unacked deliveries are
                    // requeued once the channel closes.
                    log_debug!("[{link_id}] subscriber for {queue} went away");
                    if let Err(e) = channel
                        .basic_cancel(consumer_tag.as_str().into(), BasicCancelOptions::default())
                        .await
                    {
                        log_warn!("[{link_id}] cancel of {consumer_tag} failed: {e}");
                    }
                    break;
                }
            }

            log_debug!("[{link_id}] consumer task ended for {queue}");
        });

        self.consumers.push(handle);
        Ok(())
    }
}
