use super::*;

/// Identity established once a worker has authorized; carried for the lifetime of the
/// connection so share submission can be validated without re-parsing `mining.authorize`.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) enonce1: Extranonce,
    pub(crate) address: Address,
    pub(crate) workername: String,
    pub(crate) username: Username,
}

#[derive(Debug, Clone)]
pub(crate) enum State {
    Fresh {
        version_mask: Option<Version>,
    },

    Subscribed {
        enonce1: Extranonce,
        user_agent: String,
        version_mask: Option<Version>,
    },

    Working {
        user_agent: String,
        version_mask: Option<Version>,
        session: Arc<Session>,
    },
}

impl State {
    pub(crate) fn new() -> Self {
        State::Fresh { version_mask: None }
    }

    pub(crate) fn configure(&mut self, version_mask: Version) -> bool {
        match self {
            State::Fresh {
                version_mask: mask, ..
            }
            | State::Subscribed {
                version_mask: mask, ..
            }
            | State::Working {
                version_mask: mask, ..
            } => {
                *mask = Some(version_mask);
                true
            }
        }
    }

    pub(crate) fn subscribe(&mut self, enonce1: Extranonce, user_agent: String) {
        let version_mask = self.version_mask();
        *self = State::Subscribed {
            enonce1,
            user_agent,
            version_mask,
        };
    }

    pub(crate) fn authorize(
        &mut self,
        address: Address,
        workername: String,
        username: Username,
    ) -> bool {
        match self {
            State::Subscribed {
                enonce1,
                user_agent,
                version_mask,
            } => {
                *self = State::Working {
                    user_agent: user_agent.clone(),
                    version_mask: *version_mask,
                    session: Arc::new(Session {
                        enonce1: enonce1.clone(),
                        address,
                        workername,
                        username,
                    }),
                };
                true
            }
            _ => false,
        }
    }

    pub(crate) fn version_mask(&self) -> Option<Version> {
        match self {
            State::Fresh { version_mask } => *version_mask,
            State::Subscribed { version_mask, .. } => *version_mask,
            State::Working { version_mask, .. } => *version_mask,
        }
    }

    pub(crate) fn user_agent(&self) -> Option<&str> {
        match self {
            State::Fresh { .. } => None,
            State::Subscribed { user_agent, .. } => Some(user_agent),
            State::Working { user_agent, .. } => Some(user_agent),
        }
    }

    pub(crate) fn subscribed(&self) -> Option<Extranonce> {
        match self {
            State::Subscribed { enonce1, .. } => Some(enonce1.clone()),
            State::Working { session, .. } => Some(session.enonce1.clone()),
            State::Fresh { .. } => None,
        }
    }

    pub(crate) fn working(&self) -> Option<Arc<Session>> {
        match self {
            State::Working { session, .. } => Some(session.clone()),
            _ => None,
        }
    }

    pub(crate) fn not_subscribed(&self) -> bool {
        matches!(self, State::Fresh { .. })
    }

    pub(crate) fn is_fresh(&self) -> bool {
        matches!(self, State::Fresh { .. })
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        matches!(self, State::Subscribed { .. })
    }

    pub(crate) fn is_working(&self) -> bool {
        matches!(self, State::Working { .. })
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            State::Fresh { version_mask: None } => write!(f, "Init"),
            State::Fresh {
                version_mask: Some(_),
            } => write!(f, "Configured"),
            State::Subscribed { .. } => write!(f, "Subscribed"),
            State::Working { .. } => write!(f, "Working"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_enonce1() -> Extranonce {
        "deadbeef".parse().unwrap()
    }

    fn test_address() -> Address {
        "tb1qkrrl75qekv9ree0g2qt49j8vdynsvlc4kuctrc"
            .parse::<Address<NetworkUnchecked>>()
            .unwrap()
            .assume_checked()
    }

    fn test_username() -> Username {
        Username::new("tb1qkrrl75qekv9ree0g2qt49j8vdynsvlc4kuctrc.worker1")
    }

    #[test]
    fn new_state_is_fresh() {
        let state = State::new();

        assert!(state.is_fresh());
        assert!(!state.is_subscribed());
        assert!(!state.is_working());
        assert!(state.version_mask().is_none());
        assert!(state.subscribed().is_none());
    }

    #[test]
    fn configure_sets_version_mask_in_fresh() {
        let mut state = State::new();
        let mask = Version::from(0x1fffe000);

        assert!(state.configure(mask));

        assert!(state.is_fresh());
        assert_eq!(state.version_mask(), Some(mask));
    }

    #[test]
    fn subscribe_transitions_to_subscribed() {
        let mut state = State::new();
        let enonce1 = test_enonce1();

        state.subscribe(enonce1.clone(), "test/1.0".into());

        assert!(!state.is_fresh());
        assert!(state.is_subscribed());
        assert!(!state.is_working());
        assert_eq!(state.subscribed(), Some(enonce1));
    }

    #[test]
    fn subscribe_preserves_version_mask() {
        let mut state = State::new();
        let mask = Version::from(0x1fffe000);

        state.configure(mask);
        state.subscribe(test_enonce1(), "test/1.0".into());

        assert!(state.is_subscribed());
        assert_eq!(state.version_mask(), Some(mask));
    }

    #[test]
    fn authorize_in_subscribed_transitions_to_working() {
        let mut state = State::new();

        state.subscribe(test_enonce1(), "test/1.0".into());
        let ok = state.authorize(test_address(), "worker1".into(), test_username());

        assert!(ok);
        assert!(state.is_working());
        assert!(!state.is_subscribed());

        let session = state.working().unwrap();
        assert_eq!(session.address, test_address());
        assert_eq!(session.workername, "worker1");
    }

    #[test]
    fn authorize_in_fresh_fails() {
        let mut state = State::new();

        let ok = state.authorize(test_address(), "worker1".into(), test_username());

        assert!(!ok);
        assert!(state.is_fresh());
    }

    #[test]
    fn authorize_in_working_fails() {
        let mut state = State::new();

        state.subscribe(test_enonce1(), "test/1.0".into());
        assert!(state.authorize(test_address(), "worker1".into(), test_username()));

        let ok = state.authorize(test_address(), "worker2".into(), test_username());

        assert!(!ok);
        assert!(state.is_working());
    }

    #[test]
    fn resubscribe_from_working_resets_to_subscribed() {
        let mut state = State::new();

        state.subscribe(test_enonce1(), "test/1.0".into());
        state.authorize(test_address(), "worker1".into(), test_username());

        assert!(state.is_working());

        let new_enonce1: Extranonce = "cafebabe".parse().unwrap();
        state.subscribe(new_enonce1.clone(), "test/2.0".into());

        assert!(state.is_subscribed());
        assert!(!state.is_working());
        assert_eq!(state.subscribed(), Some(new_enonce1));
    }

    #[test]
    fn configure_works_in_all_states() {
        let mut state = State::new();
        let mask1 = Version::from(0x1fffe000);
        let mask2 = Version::from(0x0ffff000);

        // Fresh
        state.configure(mask1);
        assert_eq!(state.version_mask(), Some(mask1));

        // Subscribed
        state.subscribe(test_enonce1(), "test/1.0".into());
        state.configure(mask2);
        assert_eq!(state.version_mask(), Some(mask2));

        // Working
        state.authorize(test_address(), "worker1".into(), test_username());
        state.configure(mask1);
        assert_eq!(state.version_mask(), Some(mask1));
    }

    #[test]
    fn display_shows_correct_state_names() {
        let mut state = State::new();
        assert_eq!(state.to_string(), "Init");

        state.configure(Version::from(0x1fffe000));
        assert_eq!(state.to_string(), "Configured");

        state.subscribe(test_enonce1(), "test/1.0".into());
        assert_eq!(state.to_string(), "Subscribed");

        state.authorize(test_address(), "worker1".into(), test_username());
        assert_eq!(state.to_string(), "Working");
    }
}
