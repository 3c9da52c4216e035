use hashbrown::HashMap;
use std::rc::Rc;

/// Handler invoked when a client assigns a proxy-scoped session variable.
/// Returns `Err(diagnostic)` to have the message forwarded to the client
/// as an error.
pub type VariableHandler = Rc<dyn Fn(&str, &str) -> Result<(), String>>;

/// Registry of `@maxscale.*` session variables. Names are lowercased on
/// registration and lookup; the value last assigned is retained for
/// inspection.
#[derive(Default)]
pub struct SessionVariables {
    handlers: HashMap<String, VariableHandler>,
    values: HashMap<String, String>,
}

impl SessionVariables {
    pub fn new() -> Self {
        SessionVariables::default()
    }

    /// Returns false if the name is already taken.
    pub fn add(&mut self, name: &str, handler: VariableHandler) -> bool {
        let key = name.to_ascii_lowercase();
        if self.handlers.contains_key(&key) {
            return false;
        }
        self.handlers.insert(key, handler);
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.handlers.remove(&name.to_ascii_lowercase()).is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_ascii_lowercase())
    }

    /// Invoke the handler for one assignment. Unknown variables produce a
    /// diagnostic, mirroring what the server says about unknown system
    /// variables.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        let key = name.to_ascii_lowercase();
        match self.handlers.get(&key) {
            Some(handler) => {
                handler(&key, value)?;
                self.values.insert(key, value.to_string());
                Ok(())
            }
            None => Err(format!("Unknown variable: {key}")),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn names_are_case_insensitive() {
        let mut vars = SessionVariables::new();
        assert!(vars.add("@maxscale.Trace", Rc::new(|_, _| Ok(()))));
        assert!(!vars.add("@MAXSCALE.TRACE", Rc::new(|_, _| Ok(()))));
        assert!(vars.is_registered("@maxscale.trace"));

        vars.set("@MaxScale.Trace", "on").unwrap();
        assert_eq!(vars.get("@maxscale.trace"), Some("on"));
    }

    #[test]
    fn handler_rejection_is_forwarded() {
        let mut vars = SessionVariables::new();
        vars.add(
            "@maxscale.retries",
            Rc::new(|name, value| {
                value
                    .parse::<u32>()
                    .map(|_| ())
                    .map_err(|_| format!("Invalid value for {name}: {value}"))
            }),
        );
        assert!(vars.set("@maxscale.retries", "3").is_ok());
        let err = vars.set("@maxscale.retries", "many").unwrap_err();
        assert!(err.contains("Invalid value"));
    }

    #[test]
    fn unknown_variable_errors() {
        let mut vars = SessionVariables::new();
        assert!(vars.set("@maxscale.nope", "1").is_err());
    }

    #[test]
    fn handler_sees_lowercased_name() {
        let seen = Rc::new(RefCell::new(String::new()));
        let seen2 = Rc::clone(&seen);
        let mut vars = SessionVariables::new();
        vars.add(
            "@maxscale.Log_Level",
            Rc::new(move |name, _| {
                *seen2.borrow_mut() = name.to_string();
                Ok(())
            }),
        );
        vars.set("@MAXSCALE.LOG_LEVEL", "debug").unwrap();
        assert_eq!(&*seen.borrow(), "@maxscale.log_level");
    }
}
