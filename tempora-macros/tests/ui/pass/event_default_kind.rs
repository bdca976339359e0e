use serde::{Deserialize, Serialize};
use tempora::DomainEvent;

#[derive(Serialize, Deserialize, DomainEvent)]
#[event(aggregate = "account")]
pub struct FundsDeposited {
    pub amount: i64,
}

fn main() {
    assert_eq!(<FundsDeposited as DomainEvent>::KIND, "funds-deposited");
    assert_eq!(<FundsDeposited as DomainEvent>::AGGREGATE_TYPE, "account");
}
