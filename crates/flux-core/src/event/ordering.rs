//! Lógica de consulta compartida por los backends: recuperación masiva
//! ordenada y proyección por estado.
//!
//! El storage devuelve filas en su orden natural; el orden lo impone siempre
//! la aplicación a partir de la secuencia pedida por el llamador. Con nombres
//! duplicados se devuelve una sola salida por nombre distinto, en la posición
//! de su primera aparición (la misma semántica que un `IN (...)` ordenado por
//! posición en la lista).

use std::collections::{HashMap, HashSet};

use super::{EventData, EventStatus};

/// Nombres distintos preservando el orden de primera aparición. Es la lista
/// que se envía como parámetro ligado (`= ANY($n)`).
pub fn distinct_names(names: &[String]) -> Vec<&str> {
    let mut seen = HashSet::with_capacity(names.len());
    names.iter().map(String::as_str).filter(|n| seen.insert(*n)).collect()
}

/// Reordena `rows` según `requested`. Los nombres pedidos que no existen no
/// producen salida; las filas que no fueron pedidas se descartan.
pub fn order_by_requested_names(requested: &[String], rows: Vec<EventData>) -> Vec<EventData> {
    let mut by_name: HashMap<String, EventData> = rows.into_iter().map(|r| (r.name.clone(), r)).collect();
    distinct_names(requested).into_iter().filter_map(|n| by_name.remove(n)).collect()
}

/// Etiquetas persistidas de un conjunto de estados, sin repetidos.
pub fn status_labels(statuses: &[EventStatus]) -> Vec<&'static str> {
    let mut labels: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto(name: &str) -> EventData {
        EventData { name: name.into(), event_type: "t".into(), data: None, source: None }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn follows_requested_order_not_storage_order() {
        let rows = vec![dto("event1"), dto("event2"), dto("event3")];
        let out = order_by_requested_names(&names(&["event3", "event1"]), rows);
        let got: Vec<&str> = out.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(got, vec!["event3", "event1"]);
    }

    #[test]
    fn duplicates_collapse_to_first_position() {
        let rows = vec![dto("a"), dto("b")];
        let out = order_by_requested_names(&names(&["b", "a", "b", "a"]), rows);
        let got: Vec<&str> = out.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(got, vec!["b", "a"]);
        assert_eq!(distinct_names(&names(&["b", "a", "b"])), vec!["b", "a"]);
    }

    #[test]
    fn missing_names_are_skipped() {
        let out = order_by_requested_names(&names(&["ghost", "a"]), vec![dto("a")]);
        assert_eq!(out, vec![dto("a")]);
    }

    #[test]
    fn status_labels_dedup() {
        let labels = status_labels(&[EventStatus::Triggered, EventStatus::Cancelled, EventStatus::Triggered]);
        assert_eq!(labels, vec!["cancelled", "triggered"]);
    }
}
