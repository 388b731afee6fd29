use super::EmailMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpPurpose {
    Registration,
    Resend,
}

pub fn otp_email(recipient: &str, code: &str, ttl_minutes: i64, purpose: OtpPurpose) -> EmailMessage {
    let (subject, heading, lead) = match purpose {
        OtpPurpose::Registration => (
            "Email Verification OTP",
            "Email Verification",
            "Your OTP code is:",
        ),
        OtpPurpose::Resend => (
            "Resend OTP for Email Verification",
            "Resend OTP",
            "Your new OTP code is:",
        ),
    };
    let html_body = format!(
        r#"<div style="font-family: Arial, sans-serif; text-align: center;">
  <h1>{heading}</h1>
  <p>{lead}</p>
  <h2>{code}</h2>
  <p>This code will expire in {ttl_minutes} minutes.</p>
</div>"#
    );
    EmailMessage {
        recipient: recipient.to_string(),
        subject: subject.to_string(),
        html_body,
    }
}
