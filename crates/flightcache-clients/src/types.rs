use serde::{Deserialize, Serialize};

/// The id of a [`User`].
pub type UserId = u64;

/// A user, as returned by the users service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: UserId,
    pub name: String,
}

/// A single database record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_wire_format() {
        let user: User = serde_json::from_str(r#"{"userId": 7, "name": "Dora"}"#).unwrap();
        assert_eq!(
            user,
            User {
                user_id: 7,
                name: "Dora".into()
            }
        );
        assert_eq!(
            serde_json::to_string(&user).unwrap(),
            r#"{"userId":7,"name":"Dora"}"#
        );
    }
}
