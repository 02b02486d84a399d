use rand::Rng;

/// Label that triggers a disease lookup.
pub const DISEASED_LABEL: &str = "diseased";

#[derive(Debug, PartialEq, Eq)]
pub struct Disease {
    pub name: &'static str,
    pub measures: &'static [&'static str],
}

pub static DISEASES: [Disease; 4] = [
    Disease {
        name: "Grasserie",
        measures: &[
            "Remove and destroy diseased larvae immediately",
            "Disinfect rearing house with 2% formalin",
            "Avoid overcrowding of larvae",
            "Maintain optimal temperature and humidity",
        ],
    },
    Disease {
        name: "Flacherie",
        measures: &[
            "Feed leaves free from pesticides",
            "Ensure proper ventilation",
            "Maintain hygiene in rearing trays",
            "Avoid overfeeding mulberry leaves",
        ],
    },
    Disease {
        name: "Pebrine",
        measures: &[
            "Use disease-free layings (DFLs)",
            "Destroy infected worms and moths",
            "Disinfect rearing equipment",
            "Conduct microscopic examination of moths",
        ],
    },
    Disease {
        name: "Muscardine",
        measures: &[
            "Dust larvae with 2% slaked lime",
            "Maintain dry and clean environment",
            "Avoid excess humidity",
            "Remove dead larvae immediately",
        ],
    },
];

/// Uniform pick, independent of the image.
pub fn pick<R: Rng + ?Sized>(rng: &mut R) -> &'static Disease {
    &DISEASES[rng.random_range(0..DISEASES.len())]
}

#[cfg(test)]
pub fn by_name(name: &str) -> Option<&'static Disease> {
    DISEASES.iter().find(|disease| disease.name == name)
}
