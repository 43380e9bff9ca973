/// Road-surface defect categories the pretrained weights report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefectClass {
    Crack,
    Pothole,
    SpeedBump,
}

impl DefectClass {
    pub const ALL: [DefectClass; 3] = [
        DefectClass::Crack,
        DefectClass::Pothole,
        DefectClass::SpeedBump,
    ];

    /// Map a raw model class id onto a known category.
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(DefectClass::Crack),
            1 => Some(DefectClass::Pothole),
            2 => Some(DefectClass::SpeedBump),
            _ => None,
        }
    }

    pub fn id(self) -> i64 {
        match self {
            DefectClass::Crack => 0,
            DefectClass::Pothole => 1,
            DefectClass::SpeedBump => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DefectClass::Crack => "crack",
            DefectClass::Pothole => "pothole",
            DefectClass::SpeedBump => "speed bump",
        }
    }
}

/// Pretrained weight sizes shipped with the tool.
///
/// The variants trade accuracy against inference latency; `Small` is the
/// balanced default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelVariant {
    Nano,
    #[default]
    Small,
    Medium,
}

impl ModelVariant {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "nano" | "n" => Some(ModelVariant::Nano),
            "small" | "s" => Some(ModelVariant::Small),
            "medium" | "m" => Some(ModelVariant::Medium),
            _ => None,
        }
    }

    /// File name of the TorchScript export for this variant.
    pub fn weights_file(self) -> &'static str {
        match self {
            ModelVariant::Nano => "bestn.pt",
            ModelVariant::Small => "bests.pt",
            ModelVariant::Medium => "bestm.pt",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelVariant::Nano => "nano",
            ModelVariant::Small => "small",
            ModelVariant::Medium => "medium",
        }
    }
}
