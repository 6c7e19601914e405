//! 群发受众与私信权限

use serde::{Deserialize, Serialize};

/// 群发的受众规则，关系必须早于群发创建时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceRule {
    /// 关注了发送者的用户
    FollowerAudience,
    /// 给发送者打赏过的用户
    TipperAudience,
    /// 翻混过发送者曲目的用户
    RemixerAudience,
    /// 购买过发送者内容的用户
    CustomerAudience,
}

impl AudienceRule {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "follower_audience" => Some(Self::FollowerAudience),
            "tipper_audience" => Some(Self::TipperAudience),
            "remixer_audience" => Some(Self::RemixerAudience),
            "customer_audience" => Some(Self::CustomerAudience),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FollowerAudience => "follower_audience",
            Self::TipperAudience => "tipper_audience",
            Self::RemixerAudience => "remixer_audience",
            Self::CustomerAudience => "customer_audience",
        }
    }

    pub const ALL: [AudienceRule; 4] = [
        Self::FollowerAudience,
        Self::TipperAudience,
        Self::RemixerAudience,
        Self::CustomerAudience,
    ];
}

/// 接收者设置的私信权限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPermit {
    All,
    None,
    /// 只接受自己关注的人
    Followees,
    /// 只接受给自己打赏过的人
    Tippers,
    /// 只接受认证用户
    Verified,
}

impl ChatPermit {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "all" => Some(Self::All),
            "none" => Some(Self::None),
            "followees" => Some(Self::Followees),
            "tippers" => Some(Self::Tippers),
            "verified" => Some(Self::Verified),
            _ => None,
        }
    }
}

/// 判断权限所需的关系事实，每一轮都重新查询
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionFacts {
    /// 接收者的权限设置，原始字符串
    pub permits: Vec<String>,
    pub recipient_follows_sender: bool,
    pub sender_tipped_recipient: bool,
    pub sender_verified: bool,
    /// 任一方拉黑了另一方
    pub blocked: bool,
}

impl PermissionFacts {
    /// 发送者当前能否给接收者发私信
    ///
    /// 没有任何权限记录视为 `all`；多条记录满足任意一条即可。
    pub fn is_permitted(&self) -> bool {
        if self.blocked {
            return false;
        }
        let permits: Vec<ChatPermit> = self
            .permits
            .iter()
            .filter_map(|p| ChatPermit::parse(p))
            .collect();
        if permits.is_empty() {
            return true;
        }
        permits.iter().any(|permit| match permit {
            ChatPermit::All => true,
            ChatPermit::None => false,
            ChatPermit::Followees => self.recipient_follows_sender,
            ChatPermit::Tippers => self.sender_tipped_recipient,
            ChatPermit::Verified => self.sender_verified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(permits: &[&str]) -> PermissionFacts {
        PermissionFacts {
            permits: permits.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_audience_rule_names() {
        for rule in AudienceRule::ALL {
            assert_eq!(AudienceRule::parse(rule.as_str()), Some(rule));
        }
        assert_eq!(AudienceRule::parse("everyone"), None);
    }

    #[test]
    fn test_default_permits_everyone() {
        assert!(facts(&[]).is_permitted());
        assert!(facts(&["all"]).is_permitted());
        assert!(!facts(&["none"]).is_permitted());
    }

    #[test]
    fn test_tippers_only() {
        let mut f = facts(&["tippers"]);
        assert!(!f.is_permitted());
        f.sender_tipped_recipient = true;
        assert!(f.is_permitted());
    }

    #[test]
    fn test_any_permit_suffices() {
        let mut f = facts(&["followees", "verified"]);
        assert!(!f.is_permitted());
        f.sender_verified = true;
        assert!(f.is_permitted());
    }

    #[test]
    fn test_block_overrides_permits() {
        let mut f = facts(&["all"]);
        f.blocked = true;
        assert!(!f.is_permitted());
    }
}
