//! Client-side checks run before any identity call.

use super::ValidationError;

/// Minimum password length accepted at registration
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Punctuation accepted as the required password symbol
pub const PASSWORD_SYMBOLS: &str = "@$!%*?&";

/// Check that an email has the `local@domain.tld` shape.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let email = email.trim();
    let (local, domain) = email.split_once('@').ok_or(ValidationError::InvalidEmail)?;

    let well_formed = |part: &str| {
        !part.is_empty() && !part.chars().any(|c| c.is_whitespace() || c == '@')
    };
    if !well_formed(local) || !well_formed(domain) {
        return Err(ValidationError::InvalidEmail);
    }

    // Domain needs a dot with something on both sides of the last one
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() => Ok(()),
        _ => Err(ValidationError::InvalidEmail),
    }
}

/// Check password strength, reporting the first rule that fails.
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::PasswordTooShort(MIN_PASSWORD_LENGTH));
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return Err(ValidationError::PasswordMissingUppercase);
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err(ValidationError::PasswordMissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::PasswordMissingDigit);
    }
    if !password.chars().any(|c| PASSWORD_SYMBOLS.contains(c)) {
        return Err(ValidationError::PasswordMissingSymbol(PASSWORD_SYMBOLS));
    }
    Ok(())
}

pub fn validate_registration(
    username: &str,
    email: &str,
    password: &str,
) -> Result<(), ValidationError> {
    if username.trim().is_empty() {
        return Err(ValidationError::EmptyUsername);
    }
    validate_email(email)?;
    validate_password(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_emails() {
        assert!(validate_email("bob@example.com").is_ok());
        assert!(validate_email("first.last+tag@mail.example.org").is_ok());
        assert!(validate_email("  padded@example.com ").is_ok());
    }

    #[test]
    fn test_invalid_emails() {
        for email in [
            "",
            "not-an-email",
            "@example.com",
            "bob@",
            "bob@example",
            "bob@example.",
            "bob@.com",
            "bob@@example.com",
            "bo b@example.com",
            "bob@exa mple.com",
        ] {
            assert_eq!(
                validate_email(email),
                Err(ValidationError::InvalidEmail),
                "{email:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_password_rules_in_order() {
        assert_eq!(
            validate_password("Pa1!"),
            Err(ValidationError::PasswordTooShort(8))
        );
        assert_eq!(
            validate_password("password1!"),
            Err(ValidationError::PasswordMissingUppercase)
        );
        assert_eq!(
            validate_password("PASSWORD1!"),
            Err(ValidationError::PasswordMissingLowercase)
        );
        assert_eq!(
            validate_password("Password!!"),
            Err(ValidationError::PasswordMissingDigit)
        );
        assert_eq!(
            validate_password("Password12"),
            Err(ValidationError::PasswordMissingSymbol(PASSWORD_SYMBOLS))
        );
        // '#' is not in the accepted set
        assert_eq!(
            validate_password("Password1#"),
            Err(ValidationError::PasswordMissingSymbol(PASSWORD_SYMBOLS))
        );
        assert!(validate_password("Password1!").is_ok());
    }

    #[test]
    fn test_registration_checks_username_first() {
        assert_eq!(
            validate_registration("  ", "bob@example.com", "Password1!"),
            Err(ValidationError::EmptyUsername)
        );
        assert_eq!(
            validate_registration("bob", "not-an-email", "Password1!"),
            Err(ValidationError::InvalidEmail)
        );
        assert!(validate_registration("bob", "bob@example.com", "Password1!").is_ok());
    }
}
