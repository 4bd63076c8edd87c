//! Email service credential detectors.

mod mailgun;
mod sendgrid;

pub use mailgun::MailgunDetector;
pub use sendgrid::SendGridDetector;
