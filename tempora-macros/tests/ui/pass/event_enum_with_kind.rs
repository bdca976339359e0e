use serde::{Deserialize, Serialize};
use tempora::DomainEvent;

#[derive(Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "account", kind = "account-flagged")]
pub enum Flag {
    Frozen,
    Review { reason: String },
}

fn main() {
    assert_eq!(<Flag as DomainEvent>::KIND, "account-flagged");
}
