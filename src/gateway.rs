use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::dispatch::{DispatchPlan, Dispatcher};
use crate::filter;
use crate::format::DeliveryPayload;
use crate::settings::store::SettingsStore;
use crate::source::{EventSource, InboundMessageEvent};

const OBSERVER_CAPACITY: usize = 64;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The listener is switched off.
    Disabled,
    /// Neither whitelist admitted the message.
    Filtered,
    Accepted {
        dispatch_id: Uuid,
        payload: Arc<DeliveryPayload>,
        plan: DispatchPlan,
    },
}

/// Per-event pipeline: settings snapshot, filter, observers, fan-out.
pub struct Gateway {
    store: SettingsStore,
    dispatcher: Arc<Dispatcher>,
    observers: broadcast::Sender<Arc<DeliveryPayload>>,
}

impl Gateway {
    pub fn new(store: SettingsStore, dispatcher: Arc<Dispatcher>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            store,
            dispatcher,
            observers,
        }
    }

    /// Receive every accepted message. Slow receivers lag; they never block
    /// delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DeliveryPayload>> {
        self.observers.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.receiver_count()
    }

    pub async fn handle_event(&self, event: InboundMessageEvent) -> Outcome {
        let settings = Arc::new(self.store.get_all().await);
        if !settings.enabled {
            debug!("SMS listener disabled, ignoring message from {}", event.sender);
            return Outcome::Disabled;
        }

        if !filter::accept(
            &event.sender,
            &event.body,
            &settings.sender_filter,
            &settings.keyword_filter,
        ) {
            info!("Sender and message not match any whitelist items. Ignoring.");
            return Outcome::Filtered;
        }

        let dispatch_id = Uuid::new_v4();
        let span = info_span!("sms", %dispatch_id);
        async {
            debug!(
                "SMS from: {} line: {:?} phone: {:?}\n{}",
                event.sender, event.line_identifier, settings.user_phone_number, event.body
            );

            let payload = Arc::new(DeliveryPayload::from_event(
                &event,
                &settings.user_phone_number,
            ));

            // No subscribers is fine.
            let _ = self.observers.send(payload.clone());

            let plan = self
                .dispatcher
                .dispatch(settings.clone(), payload.clone(), dispatch_id);

            Outcome::Accepted {
                dispatch_id,
                payload,
                plan,
            }
        }
        .instrument(span)
        .await
    }

    /// Feed every event from `source` through the pipeline until it ends.
    /// Returns the number of accepted messages.
    pub async fn run<S: EventSource + ?Sized>(&self, source: &mut S) -> usize {
        let mut accepted = 0;
        while let Some(event) = source.next_event().await {
            if let Outcome::Accepted {
                dispatch_id,
                payload,
                plan,
            } = self.handle_event(event).await
            {
                debug!(
                    %dispatch_id,
                    http = plan.http,
                    telegram = plan.telegram,
                    "Dispatched message from {}",
                    payload.sender
                );
                accepted += 1;
            }
        }
        info!("Event source exhausted, {} messages accepted", accepted);
        accepted
    }
}
