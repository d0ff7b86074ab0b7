use std::fmt;

/// Products the classifier recognizes, in catalog order.
pub const PRODUCTS: [&str; 10] = [
    "Apple",
    "Banana",
    "Mango",
    "Orange",
    "Strawberry",
    "Carrot",
    "Potato",
    "Tomato",
    "Cucumber",
    "Bellpepper",
];

/// Number of classes produced by the default classifier head.
pub const DEFAULT_CLASS_COUNT: usize = PRODUCTS.len() * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Rotten,
}

impl Freshness {
    pub fn as_str(self) -> &'static str {
        match self {
            Freshness::Fresh => "Fresh",
            Freshness::Rotten => "Rotten",
        }
    }
}

/// One classifier output, e.g. `FreshApple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLabel {
    pub freshness: Freshness,
    pub product: &'static str,
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.freshness.as_str(), self.product)
    }
}

/// Class labels in model output order.
///
/// The trained head groups the products in blocks of five: fresh fruit,
/// rotten fruit, fresh vegetables, rotten vegetables.
pub fn default_labels() -> Vec<ClassLabel> {
    let (fruit, vegetables) = PRODUCTS.split_at(5);
    let mut labels = Vec::with_capacity(DEFAULT_CLASS_COUNT);
    for group in [fruit, vegetables] {
        for freshness in [Freshness::Fresh, Freshness::Rotten] {
            labels.extend(group.iter().map(|&product| ClassLabel { freshness, product }));
        }
    }
    labels
}

/// Label names to embed for a head of `class_count` outputs, if known.
pub fn labels_for(class_count: usize, configured: Option<&[String]>) -> Option<Vec<String>> {
    match configured {
        Some(labels) if labels.len() == class_count => Some(labels.to_vec()),
        Some(_) => None,
        None if class_count == DEFAULT_CLASS_COUNT => {
            Some(default_labels().iter().map(ToString::to_string).collect())
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_labels_order() {
        let labels: Vec<String> = default_labels().iter().map(ToString::to_string).collect();
        assert_eq!(labels.len(), 20);
        assert_eq!(labels[0], "FreshApple");
        assert_eq!(labels[4], "FreshStrawberry");
        assert_eq!(labels[5], "RottenApple");
        assert_eq!(labels[10], "FreshCarrot");
        assert_eq!(labels[15], "RottenCarrot");
        assert_eq!(labels[19], "RottenBellpepper");
    }

    #[test]
    fn test_labels_for_default_count() {
        let labels = labels_for(20, None).unwrap();
        assert_eq!(labels[13], "FreshCucumber");
    }

    #[test]
    fn test_labels_for_unknown_count() {
        assert!(labels_for(5, None).is_none());
    }

    #[test]
    fn test_labels_for_configured() {
        let configured = vec!["a".to_string(), "b".to_string()];
        assert_eq!(labels_for(2, Some(&configured)).unwrap(), configured);
        assert!(labels_for(3, Some(&configured)).is_none());
    }
}
