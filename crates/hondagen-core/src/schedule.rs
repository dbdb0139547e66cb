use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Model;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    // User-serviceable
    OilChange,
    AirFilterClean,
    AirFilterReplace,
    SparkPlugCheck,
    SparkPlugReplace,
    SparkArresterClean,
    SedimentCupClean,
    // Dealer-service
    ValveClearance,
    TimingBelt,
    CombustionChamber,
    FuelTankClean,
    FuelPumpFilter,
    FuelSystemCheck,
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::OilChange => "Oil Change",
            ServiceKind::AirFilterClean => "Air Filter Clean",
            ServiceKind::AirFilterReplace => "Air Filter Replace",
            ServiceKind::SparkPlugCheck => "Spark Plug Check",
            ServiceKind::SparkPlugReplace => "Spark Plug Replace",
            ServiceKind::SparkArresterClean => "Spark Arrester Clean",
            ServiceKind::SedimentCupClean => "Sediment Cup Clean",
            ServiceKind::ValveClearance => "Valve Clearance Check",
            ServiceKind::TimingBelt => "Timing Belt Check",
            ServiceKind::CombustionChamber => "Combustion Chamber Clean",
            ServiceKind::FuelTankClean => "Fuel Tank/Filter Clean",
            ServiceKind::FuelPumpFilter => "Fuel Pump Filter Replace",
            ServiceKind::FuelSystemCheck => "Fuel System Check",
        }
    }
}

/// Dual-threshold interval. Either element may be absent (hour-only or
/// date-only items), never both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub hours: Option<f64>,
    pub days: Option<u32>,
}

impl Interval {
    pub const fn new(hours: Option<f64>, days: Option<u32>) -> Self {
        Self { hours, days }
    }
}

/// Oil change interval that applies until the first completion.
pub const OIL_CHANGE_BREAK_IN: Interval = Interval::new(Some(20.0), Some(30));

#[derive(Debug, Clone)]
pub struct ServiceItem {
    pub kind: ServiceKind,
    pub interval: Interval,
    /// Applies only while the record's completed-once flag is false.
    pub break_in: Option<Interval>,
    pub dealer_service: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("service item {0:?} defines neither an hour nor a day interval")]
    UndefinedInterval(ServiceKind),
}

/// The set of service items applicable to one model, validated at
/// construction so an unsatisfiable item is a load-time error.
#[derive(Debug, Clone)]
pub struct Schedule {
    items: Vec<ServiceItem>,
}

impl Schedule {
    pub fn new(items: Vec<ServiceItem>) -> Result<Self, ScheduleError> {
        for item in &items {
            if item.interval.hours.is_none() && item.interval.days.is_none() {
                return Err(ScheduleError::UndefinedInterval(item.kind));
            }
        }
        Ok(Self { items })
    }

    pub fn for_model(model: Model) -> Self {
        // Tables are static and pre-validated; new() cannot fail on them.
        Self::new(model_items(model)).expect("static schedule tables are valid")
    }

    pub fn items(&self) -> &[ServiceItem] {
        &self.items
    }

    pub fn item(&self, kind: ServiceKind) -> Option<&ServiceItem> {
        self.items.iter().find(|i| i.kind == kind)
    }
}

fn item(
    kind: ServiceKind,
    hours: Option<f64>,
    days: Option<u32>,
    dealer_service: bool,
) -> ServiceItem {
    let break_in = match kind {
        ServiceKind::OilChange => Some(OIL_CHANGE_BREAK_IN),
        _ => None,
    };
    ServiceItem {
        kind,
        interval: Interval::new(hours, days),
        break_in,
        dealer_service,
    }
}

// Factory-manual maintenance schedules per model. Unknown models get
// the conservative defaults (shortest intervals).
fn model_items(model: Model) -> Vec<ServiceItem> {
    use ServiceKind::*;
    match model {
        Model::Eu2200i => vec![
            item(OilChange, Some(100.0), Some(180), false),
            item(AirFilterClean, Some(50.0), Some(90), false),
            item(SparkPlugCheck, Some(100.0), Some(180), false),
            item(SparkPlugReplace, Some(200.0), Some(365), false),
            item(SparkArresterClean, Some(100.0), Some(180), false),
            item(ValveClearance, Some(200.0), Some(365), true),
            item(CombustionChamber, Some(300.0), None, true),
            item(FuelTankClean, Some(200.0), Some(365), true),
            item(FuelSystemCheck, None, Some(730), true),
        ],
        Model::Eu3200i => vec![
            item(OilChange, Some(100.0), Some(180), false),
            item(AirFilterClean, Some(50.0), Some(90), false),
            item(AirFilterReplace, Some(300.0), Some(365), false),
            item(SparkPlugCheck, Some(100.0), Some(180), false),
            item(SparkPlugReplace, Some(300.0), Some(365), false),
            item(SparkArresterClean, Some(300.0), Some(365), false),
            item(ValveClearance, Some(300.0), Some(365), true),
            item(TimingBelt, Some(250.0), Some(365), true),
            item(CombustionChamber, Some(500.0), None, true),
            item(FuelTankClean, Some(1000.0), Some(730), true),
            item(FuelPumpFilter, Some(1000.0), Some(730), true),
            item(FuelSystemCheck, None, Some(730), true),
        ],
        Model::Em5000sx | Model::Em6500sx => vec![
            item(OilChange, Some(100.0), Some(180), false),
            item(AirFilterClean, Some(50.0), Some(90), false),
            item(SparkPlugCheck, Some(100.0), Some(180), false),
            item(SparkPlugReplace, Some(300.0), Some(365), false),
            item(SparkArresterClean, Some(300.0), Some(365), false),
            item(SedimentCupClean, Some(100.0), Some(180), false),
            item(ValveClearance, Some(300.0), Some(365), true),
            item(CombustionChamber, Some(1000.0), None, true),
            item(FuelTankClean, Some(300.0), Some(365), true),
            item(FuelSystemCheck, None, Some(730), true),
        ],
        Model::Eu7000is => vec![
            item(OilChange, Some(100.0), Some(180), false),
            item(AirFilterClean, Some(50.0), Some(90), false),
            item(SparkPlugCheck, Some(100.0), Some(180), false),
            item(SparkPlugReplace, Some(300.0), Some(365), false),
            item(SparkArresterClean, Some(300.0), Some(365), false),
            item(SedimentCupClean, Some(100.0), Some(180), false),
            item(ValveClearance, Some(300.0), Some(365), true),
            item(CombustionChamber, Some(500.0), None, true),
            item(FuelTankClean, Some(300.0), Some(365), true),
            item(FuelSystemCheck, None, Some(730), true),
        ],
        Model::Unknown => vec![
            item(OilChange, Some(100.0), Some(180), false),
            item(AirFilterClean, Some(50.0), Some(90), false),
            item(SparkPlugCheck, Some(100.0), Some(180), false),
            item(SparkPlugReplace, Some(200.0), Some(365), false),
            item(SparkArresterClean, Some(100.0), Some(180), false),
            item(ValveClearance, Some(200.0), Some(365), true),
            item(CombustionChamber, Some(300.0), None, true),
            item(FuelTankClean, Some(200.0), Some(365), true),
            item(FuelSystemCheck, None, Some(730), true),
        ],
    }
}
