//! Synthetic checkout-pipeline messages.
//!
//! Field names follow the wire contract of the consuming services, so the
//! serde renames below are load-bearing.

use crate::config::{PAYMENT_PROCESS_QUEUE, PAYMENT_RESULT_QUEUE};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use uuid::Uuid;

/// Message shape published to a queue. Chosen once per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Checkout,
    PaymentProcess,
    PaymentResult,
}

impl MessageKind {
    /// Pipeline queues map to their own message type; anything else gets checkouts.
    pub fn for_queue(queue: &str) -> Self {
        match queue {
            PAYMENT_PROCESS_QUEUE => Self::PaymentProcess,
            PAYMENT_RESULT_QUEUE => Self::PaymentResult,
            _ => Self::Checkout,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub message_created: String,
}

impl Envelope {
    fn now() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_created: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CartDetail {
    pub id: u32,
    pub product_id: u32,
    pub product_name: String,
    pub price: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckoutHeader {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(rename = "UserID")]
    pub user_id: String,
    pub coupon_code: String,
    pub discount_amount: f64,
    pub purchase_amount: f64,
    pub first_name: String,
    pub last_name: String,
    pub date_time: String,
    pub phone: String,
    pub email: String,
    pub card_number: String,
    #[serde(rename = "CVV")]
    pub cvv: String,
    pub expiry_month_year: String,
    pub cart_total_items: usize,
    pub cart_details: Vec<CartDetail>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub order_id: u64,
    pub user_id: String,
    pub email: String,
    pub card_number: String,
    pub card_expiry_month: u32,
    pub card_expiry_year: u32,
    pub card_security_code: String,
    pub card_holder_name: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResultMessage {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub order_id: u64,
    pub status: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    Checkout(CheckoutHeader),
    PaymentProcess(PaymentMessage),
    PaymentResult(PaymentResultMessage),
}

impl Message {
    pub fn message_id(&self) -> Uuid {
        match self {
            Self::Checkout(m) => m.envelope.message_id,
            Self::PaymentProcess(m) => m.envelope.message_id,
            Self::PaymentResult(m) => m.envelope.message_id,
        }
    }
}

const PRODUCTS: [(u32, &str, f64); 5] = [
    (101, "Smartphone", 1200.00),
    (102, "Headphones", 150.00),
    (103, "Laptop", 2500.00),
    (104, "Mouse", 80.00),
    (105, "Keyboard", 250.00),
];
const FIRST_NAMES: [&str; 5] = ["Joao", "Maria", "Pedro", "Ana", "Carlos"];
const LAST_NAMES: [&str; 5] = ["Silva", "Santos", "Oliveira", "Souza", "Costa"];
const ORDER_ID_BASE: u64 = 10_000;

/// Builds messages of one kind. Each worker owns its own factory.
pub struct MessageFactory {
    kind: MessageKind,
    rng: StdRng,
}

impl MessageFactory {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic content apart from ids and timestamps.
    pub fn seeded(kind: MessageKind, seed: u64) -> Self {
        Self {
            kind,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `index` is the message's position in the run; it feeds user and order ids.
    pub fn build(&mut self, index: u64) -> Message {
        match self.kind {
            MessageKind::Checkout => Message::Checkout(self.checkout(index)),
            MessageKind::PaymentProcess => Message::PaymentProcess(self.payment(index)),
            MessageKind::PaymentResult => Message::PaymentResult(self.payment_result(index)),
        }
    }

    fn checkout(&mut self, index: u64) -> CheckoutHeader {
        let rng = &mut self.rng;
        let first = *FIRST_NAMES.choose(rng).unwrap_or(&FIRST_NAMES[0]);
        let last = *LAST_NAMES.choose(rng).unwrap_or(&LAST_NAMES[0]);
        let items = rng.gen_range(1..=2);
        let cart_details: Vec<CartDetail> = PRODUCTS
            .choose_multiple(rng, items)
            .enumerate()
            .map(|(i, &(product_id, name, price))| CartDetail {
                id: i as u32 + 1,
                product_id,
                product_name: name.to_string(),
                price,
                quantity: 1,
            })
            .collect();
        let total = cart_details
            .iter()
            .map(|d| d.price * f64::from(d.quantity))
            .sum::<f64>();
        CheckoutHeader {
            envelope: Envelope::now(),
            user_id: format!("loadtest_user_{}", index),
            coupon_code: String::new(),
            discount_amount: 0.0,
            purchase_amount: round_cents(total),
            first_name: first.to_string(),
            last_name: last.to_string(),
            date_time: Utc::now().to_rfc3339(),
            phone: format!(
                "(11) {}-{}",
                rng.gen_range(90000..=99999),
                rng.gen_range(1000..=9999)
            ),
            email: format!("{}.{}@email.com", first.to_lowercase(), last.to_lowercase()),
            card_number: format!("411111111111{}", rng.gen_range(1000..=9999)),
            cvv: rng.gen_range(100..=999).to_string(),
            expiry_month_year: format!("{:02}/{}", rng.gen_range(1..=12), rng.gen_range(25..=30)),
            cart_total_items: cart_details.len(),
            cart_details,
        }
    }

    fn payment(&mut self, index: u64) -> PaymentMessage {
        let rng = &mut self.rng;
        PaymentMessage {
            envelope: Envelope::now(),
            order_id: ORDER_ID_BASE + index,
            user_id: format!("loadtest_user_{}", index),
            email: format!("user{}@email.com", index),
            card_number: format!("411111111111{:04}", index % 10_000),
            card_expiry_month: rng.gen_range(1..=12),
            card_expiry_year: rng.gen_range(2025..=2030),
            card_security_code: rng.gen_range(100..=999).to_string(),
            card_holder_name: format!("User {}", index),
            amount: round_cents(rng.gen_range(50.0..2000.0)),
        }
    }

    fn payment_result(&mut self, index: u64) -> PaymentResultMessage {
        // Roughly one in ten payments is declined.
        let status = if self.rng.gen_bool(0.9) {
            "Sucesso"
        } else {
            "Recusado"
        };
        PaymentResultMessage {
            envelope: Envelope::now(),
            order_id: ORDER_ID_BASE + index,
            status: status.to_string(),
            email: format!("user{}@email.com", index),
        }
    }
}

fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHECKOUT_QUEUE;
    use serde_json::Value;

    #[test]
    fn queue_selects_message_kind() {
        assert_eq!(MessageKind::for_queue(CHECKOUT_QUEUE), MessageKind::Checkout);
        assert_eq!(
            MessageKind::for_queue(PAYMENT_PROCESS_QUEUE),
            MessageKind::PaymentProcess
        );
        assert_eq!(
            MessageKind::for_queue(PAYMENT_RESULT_QUEUE),
            MessageKind::PaymentResult
        );
        assert_eq!(MessageKind::for_queue("scratch"), MessageKind::Checkout);
    }

    #[test]
    fn checkout_uses_consumer_field_names() {
        let mut f = MessageFactory::seeded(MessageKind::Checkout, 7);
        let v = serde_json::to_value(f.build(3)).expect("json");
        assert_eq!(v["UserID"], Value::from("loadtest_user_3"));
        assert!(v["message_id"].is_string());
        assert!(v["message_created"].is_string());
        assert!(v["CVV"].is_string());
        let items = v["CartDetails"].as_array().expect("cart");
        assert!(!items.is_empty() && items.len() <= 2);
        assert_eq!(v["CartTotalItems"], Value::from(items.len()));
        let total: f64 = items.iter().map(|i| i["Price"].as_f64().unwrap_or(0.0)).sum();
        assert_eq!(v["PurchaseAmount"].as_f64(), Some(total));
    }

    #[test]
    fn payment_messages_carry_order_ids() {
        let mut f = MessageFactory::seeded(MessageKind::PaymentProcess, 1);
        let v = serde_json::to_value(f.build(5)).expect("json");
        assert_eq!(v["OrderId"], Value::from(10_005u64));
        assert_eq!(v["CardNumber"], Value::from("4111111111110005"));
        let amount = v["Amount"].as_f64().expect("amount");
        assert!((50.0..=2000.0).contains(&amount));

        let mut f = MessageFactory::seeded(MessageKind::PaymentResult, 1);
        let v = serde_json::to_value(f.build(5)).expect("json");
        assert_eq!(v["orderId"], Value::from(10_005u64));
        let status = v["status"].as_str().expect("status");
        assert!(status == "Sucesso" || status == "Recusado");
    }

    #[test]
    fn message_ids_are_unique() {
        let mut f = MessageFactory::new(MessageKind::Checkout);
        let a = f.build(0).message_id();
        let b = f.build(0).message_id();
        assert_ne!(a, b);
    }
}
