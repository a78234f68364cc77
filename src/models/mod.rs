// src/models/mod.rs
pub mod account;
pub mod action;
pub mod balance;
pub mod cdr;
pub mod cost;
pub mod descriptor;
pub mod tariff;

pub use account::Account;
pub use action::{Action, ActionPlan, ActionTrigger, AttrExecuteAction, SharedGroup};
pub use balance::{Balance, BalanceChain};
pub use cdr::{CdrFilter, StoredCdr};
pub use cost::{CallCost, MinuteInfo, TimeSpan};
pub use descriptor::CallDescriptor;
pub use tariff::{
    Destination, DestinationMatch, DestinationRate, DestinationRateBinding, MaxCostStrategy,
    Rate, RateInterval, RateSlot, RatingPlan, RatingPlanActivation, RatingProfile, PlanBinding,
    RoundingMethod, Timing,
};

// Reserved tag values shared across the tariff and accounting layers.
pub const ANY: &str = "*any";
pub const ASAP: &str = "*asap";
pub const UNLIMITED: &str = "*unlimited";

pub const OUTBOUND: &str = "*out";
pub const INBOUND: &str = "*in";

pub const VOICE: &str = "*voice";
pub const MONETARY: &str = "*monetary";
pub const SMS: &str = "*sms";
pub const DATA: &str = "*data";

pub const META_RATED: &str = "*rated";
pub const META_PREPAID: &str = "*prepaid";
pub const META_POSTPAID: &str = "*postpaid";
pub const META_PSEUDOPREPAID: &str = "*pseudoprepaid";
pub const META_NONE: &str = "*none";

pub const DEFAULT_RUNID: &str = "*default";
pub const OK: &str = "OK";
