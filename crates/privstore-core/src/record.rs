//! Settings record model
//!
//! A `SettingRecord` holds one tri-state `PolicyValue` per data `Category`
//! for a single application, plus its allowed contacts and the default-deny
//! flag. Categories map one-to-one onto columns of the `settings` table.

use std::collections::BTreeSet;
use std::fmt;

/// Global setting: whether the subsystem is enabled.
pub const SETTING_ENABLED: &str = "enabled";
/// Global setting: whether notifications are enabled.
pub const SETTING_NOTIFICATIONS_ENABLED: &str = "notifications_enabled";
/// Global setting: current schema version.
pub const SETTING_DB_VERSION: &str = "db_version";

/// Stored form of boolean global settings.
pub const VALUE_TRUE: &str = "1";
pub const VALUE_FALSE: &str = "0";

/// What an application gets when it touches a data category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PolicyValue {
    /// Real data is returned
    #[default]
    Real = 0,
    /// Empty or fake data is returned
    Empty = 1,
    /// The access fails
    Error = 2,
}

impl PolicyValue {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(PolicyValue::Real),
            1 => Some(PolicyValue::Empty),
            2 => Some(PolicyValue::Error),
            _ => None,
        }
    }

    /// Value used for a category with no stored decision.
    pub fn unresolved(default_deny: bool) -> Self {
        if default_deny {
            PolicyValue::Empty
        } else {
            PolicyValue::Real
        }
    }
}

impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyValue::Real => "REAL",
            PolicyValue::Empty => "EMPTY",
            PolicyValue::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Privacy-sensitive data categories, in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    DeviceId,
    Line1Number,
    LocationGps,
    LocationNetwork,
    NetworkInfo,
    SimInfo,
    SimSerialNumber,
    SubscriberId,
    Accounts,
    AccountsAuthTokens,
    OutgoingCalls,
    IncomingCalls,
    Contacts,
    Calendar,
    Mms,
    Sms,
    CallLog,
    Bookmarks,
    SystemLogs,
    ExternalStorage,
    Camera,
    RecordAudio,
    Notification,
    IntentBootCompleted,
    SmsSend,
    PhoneCall,
    IpTableProtect,
    IccAccess,
    AddOnManagement,
    AndroidId,
    WifiInfo,
    SwitchConnectivity,
    SendMms,
    ForceOnlineState,
    SwitchWifiState,
}

impl Category {
    pub const COUNT: usize = 35;

    pub const ALL: [Category; Category::COUNT] = [
        Category::DeviceId,
        Category::Line1Number,
        Category::LocationGps,
        Category::LocationNetwork,
        Category::NetworkInfo,
        Category::SimInfo,
        Category::SimSerialNumber,
        Category::SubscriberId,
        Category::Accounts,
        Category::AccountsAuthTokens,
        Category::OutgoingCalls,
        Category::IncomingCalls,
        Category::Contacts,
        Category::Calendar,
        Category::Mms,
        Category::Sms,
        Category::CallLog,
        Category::Bookmarks,
        Category::SystemLogs,
        Category::ExternalStorage,
        Category::Camera,
        Category::RecordAudio,
        Category::Notification,
        Category::IntentBootCompleted,
        Category::SmsSend,
        Category::PhoneCall,
        Category::IpTableProtect,
        Category::IccAccess,
        Category::AddOnManagement,
        Category::AndroidId,
        Category::WifiInfo,
        Category::SwitchConnectivity,
        Category::SendMms,
        Category::ForceOnlineState,
        Category::SwitchWifiState,
    ];

    /// Position in `ALL` and in a record's value array.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Column holding this category in the `settings` table.
    pub fn column(self) -> &'static str {
        match self {
            Category::DeviceId => "deviceIdSetting",
            Category::Line1Number => "line1NumberSetting",
            Category::LocationGps => "locationGpsSetting",
            Category::LocationNetwork => "locationNetworkSetting",
            Category::NetworkInfo => "networkInfoSetting",
            Category::SimInfo => "simInfoSetting",
            Category::SimSerialNumber => "simSerialNumberSetting",
            Category::SubscriberId => "subscriberIdSetting",
            Category::Accounts => "accountsSetting",
            Category::AccountsAuthTokens => "accountsAuthTokensSetting",
            Category::OutgoingCalls => "outgoingCallsSetting",
            Category::IncomingCalls => "incomingCallsSetting",
            Category::Contacts => "contactsSetting",
            Category::Calendar => "calendarSetting",
            Category::Mms => "mmsSetting",
            Category::Sms => "smsSetting",
            Category::CallLog => "callLogSetting",
            Category::Bookmarks => "bookmarksSetting",
            Category::SystemLogs => "systemLogsSetting",
            Category::ExternalStorage => "externalStorageSetting",
            Category::Camera => "cameraSetting",
            Category::RecordAudio => "recordAudioSetting",
            Category::Notification => "notificationSetting",
            Category::IntentBootCompleted => "intentBootCompletedSetting",
            Category::SmsSend => "smsSendSetting",
            Category::PhoneCall => "phoneCallSetting",
            Category::IpTableProtect => "ipTableProtectSetting",
            Category::IccAccess => "iccAccessSetting",
            Category::AddOnManagement => "addOnManagementSetting",
            Category::AndroidId => "androidIdSetting",
            Category::WifiInfo => "wifiInfoSetting",
            Category::SwitchConnectivity => "switchConnectivitySetting",
            Category::SendMms => "sendMmsSetting",
            Category::ForceOnlineState => "forceOnlineState",
            Category::SwitchWifiState => "switchWifiStateSetting",
        }
    }

    /// Categories duplicated as plain files for callers without query access.
    pub const MIRRORED: [Category; 2] = [Category::SystemLogs, Category::IpTableProtect];
}

/// Per-application privacy settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingRecord {
    /// Row id, assigned on first insert
    pub id: Option<i64>,
    /// Application identifier
    pub app_id: String,
    values: [PolicyValue; Category::COUNT],
    /// Contact ids the application may see
    pub allowed_contacts: BTreeSet<i64>,
    /// Unresolved categories default to denial
    pub default_deny: bool,
}

impl SettingRecord {
    /// A fresh record allowing every category.
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            id: None,
            app_id: app_id.into(),
            values: [PolicyValue::Real; Category::COUNT],
            allowed_contacts: BTreeSet::new(),
            default_deny: false,
        }
    }

    /// The record returned to every reader while fail-safe is active.
    pub fn locked_down(app_id: impl Into<String>) -> Self {
        Self {
            id: None,
            app_id: app_id.into(),
            values: [PolicyValue::Empty; Category::COUNT],
            allowed_contacts: BTreeSet::new(),
            default_deny: true,
        }
    }

    pub fn get(&self, category: Category) -> PolicyValue {
        self.values[category.index()]
    }

    pub fn set(&mut self, category: Category, value: PolicyValue) {
        self.values[category.index()] = value;
    }

    /// Builder-style `set`.
    pub fn with(mut self, category: Category, value: PolicyValue) -> Self {
        self.set(category, value);
        self
    }

    /// (category, value) pairs in column order.
    pub fn values(&self) -> impl Iterator<Item = (Category, PolicyValue)> + '_ {
        Category::ALL.iter().map(move |c| (*c, self.values[c.index()]))
    }

    /// Same settings, ignoring the storage row id.
    pub fn same_settings(&self, other: &SettingRecord) -> bool {
        self.app_id == other.app_id
            && self.values == other.values
            && self.allowed_contacts == other.allowed_contacts
            && self.default_deny == other.default_deny
    }
}
