//! Formatting and parsing of HL7v2 REST resource names.
//!
//! A message name has the shape
//! `projects/{P}/locations/{L}/datasets/{D}/hl7V2Stores/{S}/messages/{M}`,
//! five literal components interleaved with five opaque IDs. Only the
//! `hl7V2Stores` spelling is accepted; the deprecated `hl7Stores` form is
//! rejected.

use crate::error::AdapterError;

const PROJECTS: &str = "projects";
const LOCATIONS: &str = "locations";
const DATASETS: &str = "datasets";
const HL7V2_STORES: &str = "hl7V2Stores";
const MESSAGES: &str = "messages";

/// The five IDs carried by a fully-qualified HL7v2 message name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7v2MessageName {
    pub project_id: String,
    pub location_id: String,
    pub dataset_id: String,
    pub store_id: String,
    pub message_id: String,
}

/// Formats the name of an HL7v2 store resource.
pub fn hl7v2_store_name(
    project_id: &str,
    location_id: &str,
    dataset_id: &str,
    store_id: &str,
) -> String {
    [
        PROJECTS, project_id, LOCATIONS, location_id, DATASETS, dataset_id, HL7V2_STORES, store_id,
    ]
    .join("/")
}

/// Formats the name of a message resource inside an HL7v2 store.
pub fn hl7v2_message_name(
    project_id: &str,
    location_id: &str,
    dataset_id: &str,
    store_id: &str,
    message_id: &str,
) -> String {
    [
        &hl7v2_store_name(project_id, location_id, dataset_id, store_id),
        MESSAGES,
        message_id,
    ]
    .join("/")
}

/// Parses a fully-qualified message name into its five IDs.
///
/// Fails on a missing or reordered literal component, a missing or empty
/// ID, or trailing components.
pub fn parse_hl7v2_message_name(name: &str) -> Result<Hl7v2MessageName, AdapterError> {
    let parts: Vec<&str> = name.split('/').collect();
    let components = [PROJECTS, LOCATIONS, DATASETS, HL7V2_STORES, MESSAGES];

    let mut ids = Vec::with_capacity(components.len());
    let mut i = 0;
    for component in components {
        if parts.len() <= i || parts[i] != component {
            return Err(AdapterError::InvalidName(format!(
                "expected component {} at position {} in {}",
                component, i, name
            )));
        }
        i += 1;
        if parts.len() <= i || parts[i].is_empty() {
            return Err(AdapterError::InvalidName(format!(
                "expected an ID at position {} in {}",
                i, name
            )));
        }
        ids.push(parts[i].to_string());
        i += 1;
    }
    if parts.len() > i {
        return Err(AdapterError::InvalidName(format!(
            "unexpected tokens {:?} in {}",
            &parts[i..],
            name
        )));
    }

    let mut ids = ids.into_iter();
    Ok(Hl7v2MessageName {
        project_id: ids.next().unwrap(),
        location_id: ids.next().unwrap(),
        dataset_id: ids.next().unwrap(),
        store_id: ids.next().unwrap(),
        message_id: ids.next().unwrap(),
    })
}
