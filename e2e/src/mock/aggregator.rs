/// Aggregates data on a backend thread, handed back when it stops
pub trait Aggregator {
    fn new() -> Self;
    fn add_connection(&mut self);
    fn add_request(&mut self);
    fn add_response(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleAggregator {
    pub connections_accepted: usize,
    pub requests_received: usize,
    pub responses_sent: usize,
}

impl Aggregator for SimpleAggregator {
    fn new() -> Self {
        Self::default()
    }
    fn add_connection(&mut self) {
        self.connections_accepted += 1;
    }
    fn add_request(&mut self) {
        self.requests_received += 1;
    }
    fn add_response(&mut self) {
        self.responses_sent += 1;
    }
}
