use std::collections::HashMap;

/// One AMQP delivery as seen by a handler: the raw body plus the
/// string-valued headers extracted from the delivery properties.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl Message {
    pub fn new(body: Vec<u8>, headers: HashMap<String, String>) -> Self {
        Self { body, headers }
    }
}
