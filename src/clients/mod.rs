pub mod ai;
pub mod venue;
pub mod venue_rest;

#[allow(unused_imports)]
pub use venue::{
    BookTop, LimitOrderRequest, Outcome, VenueClient, VenueFill, VenueOrder, VenueOrderStatus,
    VenuePosition,
};
