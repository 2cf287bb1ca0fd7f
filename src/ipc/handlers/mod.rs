pub mod academic;
pub mod admissions;
pub mod announcements;
pub mod auth;
pub mod core;
pub mod courses;
pub mod events;
pub mod faculty;
pub mod news;
pub mod notifications;
pub mod routes;
pub mod setup;
pub mod students;
pub mod users;
