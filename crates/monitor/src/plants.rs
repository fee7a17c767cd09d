//! Static plant reference table and watering-status classifier.
//!
//! Depletion fractions follow FAO-56 Table 22 ("p" = fraction of total
//! available soil water that can be depleted before moisture stress).

use serde::Serialize;

/// Profile used when a lookup misses.
pub const DEFAULT_PLANT: &str = "Generic";

/// At or above this percent the soil is waterlogged regardless of plant.
const TOO_WET_PERCENT: i64 = 90;
/// Margin above the threshold that counts as comfortably watered.
const OPTIMAL_MARGIN: i64 = 20;
/// Margin below the threshold before the plant is considered stressed.
const STRESS_MARGIN: i64 = 15;
/// Width of the advertised optimal band, capped at `OPTIMAL_CEILING`.
const OPTIMAL_WIDTH: i64 = 30;
const OPTIMAL_CEILING: i64 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlantCategory {
    Vegetable,
    Herb,
    Fruit,
    Houseplant,
    Lawn,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaterStatus {
    TooWet,
    Optimal,
    NeedsWaterSoon,
    NeedsWaterNow,
    Stressed,
}

impl WaterStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::TooWet => "too wet",
            Self::Optimal => "optimal",
            Self::NeedsWaterSoon => "needs water soon",
            Self::NeedsWaterNow => "needs water now",
            Self::Stressed => "stressed",
        }
    }

    pub fn needs_water(self) -> bool {
        matches!(self, Self::NeedsWaterNow | Self::Stressed)
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct PlantThreshold {
    pub name: &'static str,
    pub localized_name: &'static str,
    pub category: PlantCategory,
    /// FAO depletion fraction `p`, 0.0..=1.0.
    pub depletion_fraction: f64,
    /// Effective rooting depth range in metres.
    pub min_root_depth: f64,
    pub max_root_depth: f64,
    pub advice: &'static str,
    pub localized_advice: &'static str,
}

pub static PLANTS: &[PlantThreshold] = &[
    PlantThreshold {
        name: "Generic",
        localized_name: "Allgemein",
        category: PlantCategory::Generic,
        depletion_fraction: 0.50,
        min_root_depth: 0.3,
        max_root_depth: 0.6,
        advice: "Water when the top few centimetres feel dry.",
        localized_advice: "Gießen, wenn die obersten Zentimeter trocken sind.",
    },
    PlantThreshold {
        name: "Tomato",
        localized_name: "Tomate",
        category: PlantCategory::Vegetable,
        depletion_fraction: 0.40,
        min_root_depth: 0.7,
        max_root_depth: 1.5,
        advice: "Keep evenly moist; irregular watering causes blossom-end rot.",
        localized_advice: "Gleichmäßig feucht halten, unregelmäßiges Gießen fördert Blütenendfäule.",
    },
    PlantThreshold {
        name: "Lettuce",
        localized_name: "Salat",
        category: PlantCategory::Vegetable,
        depletion_fraction: 0.30,
        min_root_depth: 0.3,
        max_root_depth: 0.5,
        advice: "Shallow roots: water little and often.",
        localized_advice: "Flache Wurzeln: wenig, aber häufig gießen.",
    },
    PlantThreshold {
        name: "Potato",
        localized_name: "Kartoffel",
        category: PlantCategory::Vegetable,
        depletion_fraction: 0.35,
        min_root_depth: 0.4,
        max_root_depth: 0.6,
        advice: "Water steadily from flowering until tubers size up.",
        localized_advice: "Ab der Blüte bis zur Knollenbildung regelmäßig gießen.",
    },
    PlantThreshold {
        name: "Carrot",
        localized_name: "Karotte",
        category: PlantCategory::Vegetable,
        depletion_fraction: 0.35,
        min_root_depth: 0.5,
        max_root_depth: 1.0,
        advice: "Deep, infrequent watering keeps roots straight.",
        localized_advice: "Selten, aber durchdringend gießen für gerade Wurzeln.",
    },
    PlantThreshold {
        name: "Cucumber",
        localized_name: "Gurke",
        category: PlantCategory::Vegetable,
        depletion_fraction: 0.50,
        min_root_depth: 0.7,
        max_root_depth: 1.2,
        advice: "Water at the base in the morning; avoid wetting leaves.",
        localized_advice: "Morgens an der Basis gießen, Blätter trocken halten.",
    },
    PlantThreshold {
        name: "Bell Pepper",
        localized_name: "Paprika",
        category: PlantCategory::Vegetable,
        depletion_fraction: 0.30,
        min_root_depth: 0.5,
        max_root_depth: 1.0,
        advice: "Sensitive to drought during fruit set.",
        localized_advice: "Während des Fruchtansatzes trockenheitsempfindlich.",
    },
    PlantThreshold {
        name: "Bean",
        localized_name: "Bohne",
        category: PlantCategory::Vegetable,
        depletion_fraction: 0.45,
        min_root_depth: 0.5,
        max_root_depth: 0.9,
        advice: "Most thirsty while flowering and filling pods.",
        localized_advice: "Während Blüte und Hülsenbildung am durstigsten.",
    },
    PlantThreshold {
        name: "Basil",
        localized_name: "Basilikum",
        category: PlantCategory::Herb,
        depletion_fraction: 0.40,
        min_root_depth: 0.2,
        max_root_depth: 0.4,
        advice: "Keep moist but never waterlogged.",
        localized_advice: "Feucht halten, Staunässe vermeiden.",
    },
    PlantThreshold {
        name: "Rosemary",
        localized_name: "Rosmarin",
        category: PlantCategory::Herb,
        depletion_fraction: 0.65,
        min_root_depth: 0.3,
        max_root_depth: 0.6,
        advice: "Let the soil dry out between waterings.",
        localized_advice: "Erde zwischen den Wassergaben abtrocknen lassen.",
    },
    PlantThreshold {
        name: "Strawberry",
        localized_name: "Erdbeere",
        category: PlantCategory::Fruit,
        depletion_fraction: 0.20,
        min_root_depth: 0.2,
        max_root_depth: 0.3,
        advice: "Very shallow roots: never let the bed dry out.",
        localized_advice: "Sehr flache Wurzeln: Beet nie austrocknen lassen.",
    },
    PlantThreshold {
        name: "Raspberry",
        localized_name: "Himbeere",
        category: PlantCategory::Fruit,
        depletion_fraction: 0.50,
        min_root_depth: 0.5,
        max_root_depth: 1.0,
        advice: "Mulch and water deeply during fruiting.",
        localized_advice: "Mulchen und während der Fruchtreife tief gießen.",
    },
    PlantThreshold {
        name: "Monstera",
        localized_name: "Fensterblatt",
        category: PlantCategory::Houseplant,
        depletion_fraction: 0.50,
        min_root_depth: 0.2,
        max_root_depth: 0.4,
        advice: "Water when the top half of the pot is dry.",
        localized_advice: "Gießen, wenn die obere Topfhälfte trocken ist.",
    },
    PlantThreshold {
        name: "Lawn",
        localized_name: "Rasen",
        category: PlantCategory::Lawn,
        depletion_fraction: 0.50,
        min_root_depth: 0.5,
        max_root_depth: 1.0,
        advice: "Water deeply once or twice a week rather than daily.",
        localized_advice: "Lieber ein- bis zweimal pro Woche durchdringend als täglich gießen.",
    },
];

impl PlantThreshold {
    /// Moisture percent below which irrigation is advised.
    pub fn water_needed_threshold(&self) -> i64 {
        ((1.0 - self.depletion_fraction) * 100.0).round() as i64
    }

    /// `(lower, upper)` band the plant is happiest in.
    pub fn optimal_range(&self) -> (i64, i64) {
        let lower = self.water_needed_threshold();
        let upper = (lower + OPTIMAL_WIDTH).clamp(0, OPTIMAL_CEILING);
        (lower, upper)
    }

    /// Classify a moisture percentage. Bands are tested high to low and the
    /// first match wins.
    pub fn status(&self, percent: i64) -> WaterStatus {
        let threshold = self.water_needed_threshold();
        if percent >= TOO_WET_PERCENT {
            WaterStatus::TooWet
        } else if percent >= threshold + OPTIMAL_MARGIN {
            WaterStatus::Optimal
        } else if percent >= threshold {
            WaterStatus::NeedsWaterSoon
        } else if percent >= threshold - STRESS_MARGIN {
            WaterStatus::NeedsWaterNow
        } else {
            WaterStatus::Stressed
        }
    }

    pub fn summary(&self) -> PlantSummary {
        PlantSummary {
            name: self.name,
            localized_name: self.localized_name,
            category: self.category,
            depletion_fraction: self.depletion_fraction,
            water_needed_threshold: self.water_needed_threshold(),
            optimal_range: self.optimal_range(),
            min_root_depth: self.min_root_depth,
            max_root_depth: self.max_root_depth,
            advice: self.advice,
            localized_advice: self.localized_advice,
        }
    }
}

/// A plant profile plus its derived thresholds, as served to clients.
#[derive(Debug, Clone, Serialize)]
pub struct PlantSummary {
    pub name: &'static str,
    pub localized_name: &'static str,
    pub category: PlantCategory,
    pub depletion_fraction: f64,
    pub water_needed_threshold: i64,
    pub optimal_range: (i64, i64),
    pub min_root_depth: f64,
    pub max_root_depth: f64,
    pub advice: &'static str,
    pub localized_advice: &'static str,
}

/// The profile named [`DEFAULT_PLANT`].
pub fn default_plant() -> &'static PlantThreshold {
    // PLANTS[0] is the generic profile; the test below pins that.
    &PLANTS[0]
}

/// Exact (case-insensitive) match on either name field.
pub fn lookup(name: &str) -> Option<&'static PlantThreshold> {
    let name = name.trim();
    PLANTS.iter().find(|p| {
        p.name.eq_ignore_ascii_case(name) || p.localized_name.to_lowercase() == name.to_lowercase()
    })
}

/// Like [`lookup`] but never misses: unknown names get the default profile.
pub fn find_by_name(name: &str) -> &'static PlantThreshold {
    lookup(name).unwrap_or_else(default_plant)
}

/// Case-insensitive substring search over both name fields. An empty query
/// returns the whole table.
pub fn search(query: &str) -> Vec<&'static PlantThreshold> {
    let needle = query.trim().to_lowercase();
    PLANTS
        .iter()
        .filter(|p| {
            needle.is_empty()
                || p.name.to_lowercase().contains(&needle)
                || p.localized_name.to_lowercase().contains(&needle)
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
