use serde::Deserialize;

/// Get the user's body measurements.
#[derive(Deserialize)]
pub struct get_user_info {
    /// One of "weight_kg", "height_meters", "age".
    pub item: String,
}

impl get_user_info {
    pub fn run(&self) -> f64 {
        match self.item.as_str() {
            "weight_kg" => 75.0,
            "height_meters" => 1.8,
            "age" => 30.0,
            other => panic!("invalid option: {other}"),
        }
    }
}
