use std::collections::BTreeMap;

use serde::Serialize;
use validator::ValidateEmail;

use crate::limits::MAX_FIELD_LEN;
use crate::model::GuestDetails;

pub const FIRST_NAME: &str = "first_name";
pub const LAST_NAME: &str = "last_name";
pub const EMAIL: &str = "email";
pub const PHONE: &str = "phone";

const MIN_FIRST_NAME_LEN: usize = 3;

/// Per-field validation messages, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormErrors {
    fields: BTreeMap<&'static str, Vec<String>>,
}

impl FormErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_default().push(message.into());
    }

    /// First message for `field`, what a form renders next to the input.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|m| m.first()).map(String::as_str)
    }

    pub fn all(&self, field: &str) -> &[String] {
        self.fields.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Trim every field; what gets stored.
pub fn normalize(guest: GuestDetails) -> GuestDetails {
    GuestDetails {
        first_name: guest.first_name.trim().to_string(),
        last_name: guest.last_name.trim().to_string(),
        email: guest.email.trim().to_string(),
        phone: guest.phone.trim().to_string(),
    }
}

/// First/last name and email are required, the first name needs at least
/// three characters and the email must parse.
pub fn validate_guest_details(guest: &GuestDetails) -> Result<(), FormErrors> {
    let mut errors = FormErrors::default();

    for (field, value) in [(FIRST_NAME, &guest.first_name), (LAST_NAME, &guest.last_name), (EMAIL, &guest.email)] {
        if value.trim().is_empty() {
            errors.add(field, "This field cannot be blank");
        }
    }

    let first = guest.first_name.trim();
    if !first.is_empty() && first.chars().count() < MIN_FIRST_NAME_LEN {
        errors.add(FIRST_NAME, format!("This field must be at least {MIN_FIRST_NAME_LEN} characters long"));
    }

    let email = guest.email.trim().to_owned();
    if !email.is_empty() && !email.validate_email() {
        errors.add(EMAIL, "Invalid email address");
    }

    for (field, value) in [
        (FIRST_NAME, &guest.first_name),
        (LAST_NAME, &guest.last_name),
        (EMAIL, &guest.email),
        (PHONE, &guest.phone),
    ] {
        if value.len() > MAX_FIELD_LEN {
            errors.add(field, format!("This field must be at most {MAX_FIELD_LEN} characters long"));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
