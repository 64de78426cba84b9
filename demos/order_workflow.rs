//! Order workflow demo
//!
//! One saga per order: started by `OrderPlaced`, continued by payment and
//! shipment messages keyed on the order id, cancelled when payment does not
//! arrive in time.
//!
//! Run with `RUST_LOG=debug cargo run --example order_workflow`.

use std::time::Duration;

use saga_orchestrator::{
    ExecutionContext, HandlerResult, HandlerTable, InstanceKey, KeyReaders, Message,
    MessageStream, Saga, SagaCore, Timeout, TracingInterceptor,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// === Messages ===

#[derive(Debug)]
struct OrderPlaced {
    order_id: u32,
    amount_cents: u64,
}
impl Message for OrderPlaced {}

#[derive(Debug)]
struct PaymentReceived {
    order_id: u32,
}
impl Message for PaymentReceived {}

#[derive(Debug)]
struct ShipmentDispatched {
    order_id: u32,
}
impl Message for ShipmentDispatched {}

// === Saga ===

#[derive(Debug, Default, Serialize, Deserialize)]
enum Stage {
    #[default]
    AwaitingPayment,
    Paid,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Order {
    order_id: u32,
    amount_cents: u64,
    stage: Stage,
}

const PAYMENT_WINDOW: Duration = Duration::from_secs(2);

#[derive(Default)]
struct OrderSaga {
    core: SagaCore<Order>,
}

impl OrderSaga {
    fn on_placed(&mut self, msg: &OrderPlaced, _ctx: &mut ExecutionContext) -> HandlerResult {
        let order = &mut self.state_mut().data;
        order.order_id = msg.order_id;
        order.amount_cents = msg.amount_cents;
        self.state_mut().add_instance_key(msg.order_id);

        self.request_timeout("payment", PAYMENT_WINDOW, None)?;
        tracing::info!(order_id = msg.order_id, "Order placed, waiting for payment");
        Ok(())
    }

    fn on_paid(&mut self, msg: &PaymentReceived, _ctx: &mut ExecutionContext) -> HandlerResult {
        self.state_mut().data.stage = Stage::Paid;
        self.cancel_timeouts()?;
        tracing::info!(order_id = msg.order_id, "Payment received");
        Ok(())
    }

    fn on_shipped(&mut self, msg: &ShipmentDispatched, _ctx: &mut ExecutionContext) -> HandlerResult {
        tracing::info!(order_id = msg.order_id, "Order shipped, saga complete");
        self.set_finished();
        Ok(())
    }

    fn on_timeout(&mut self, timeout: &Timeout, _ctx: &mut ExecutionContext) -> HandlerResult {
        let order = &self.state().data;
        tracing::warn!(
            order_id = order.order_id,
            amount_cents = order.amount_cents,
            timeout = ?timeout.name(),
            "Payment window elapsed, order cancelled"
        );
        self.set_finished();
        Ok(())
    }
}

impl Saga for OrderSaga {
    type Data = Order;

    fn saga_type_name() -> &'static str {
        "order"
    }

    fn describe_handlers(handlers: &mut HandlerTable<Self>) {
        handlers
            .starts_with(Self::on_placed)
            .handles(Self::on_paid)
            .handles(Self::on_shipped)
            .handles(Self::on_timeout);
    }

    fn key_readers(&self, readers: &mut KeyReaders) {
        readers
            .read(|m: &PaymentReceived| Some(m.order_id))
            .read(|m: &ShipmentDispatched| Some(m.order_id));
    }

    fn needs_timeouts(&self) -> bool {
        true
    }

    fn core(&self) -> &SagaCore<Order> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SagaCore<Order> {
        &mut self.core
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let stream = MessageStream::builder()
        .with_saga(OrderSaga::default)
        .with_interceptor(TracingInterceptor)
        .build()?;

    // Order 1 pays and ships
    stream.handle(OrderPlaced { order_id: 1, amount_cents: 4_200 })?;
    stream.handle(PaymentReceived { order_id: 1 })?;
    stream.handle(ShipmentDispatched { order_id: 1 })?;

    // Order 2 never pays
    stream.handle(OrderPlaced { order_id: 2, amount_cents: 990 })?;
    let pending = stream
        .state_storage()
        .load_by_key("order", &InstanceKey::from(2))?;
    tracing::info!(pending = pending.len(), "Waiting for payment window to elapse");

    tokio::time::sleep(PAYMENT_WINDOW + Duration::from_millis(500)).await;

    let left = stream
        .state_storage()
        .load_by_key("order", &InstanceKey::from(2))?;
    let stats = stream.stats();
    tracing::info!(
        open_orders = left.len(),
        started = stats.sagas_started,
        finished = stats.sagas_finished,
        "Done"
    );
    Ok(())
}
