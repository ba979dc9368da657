// src/config/schema.rs

use serde_json::{json, Value};

fn service_entry_schema() -> Value {
    json!({
        "type": "object",
        "required": [
            "abbreviation", "artifact", "dir", "version_key", "runtime",
            "args", "settle_delay_secs", "role", "group"
        ],
        "properties": {
            "abbreviation": {
                "type": "string",
                "pattern": "^[a-z][a-z0-9-]*$"
            },
            "artifact": { "type": "string", "minLength": 1 },
            "dir": { "type": "string", "minLength": 1 },
            "version_key": {
                "type": "string",
                "pattern": "^[A-Z][A-Z0-9_]*$"
            },
            "runtime": { "type": "string", "minLength": 1 },
            "program": { "type": ["string", "null"] },
            "args": {
                "type": "array",
                "items": { "type": "string" }
            },
            "config_files": {
                "type": "array",
                "items": { "type": "string" }
            },
            "settle_delay_secs": {
                "type": "integer",
                "minimum": 0
            },
            "role": {
                "type": "string",
                "enum": ["plain", "deployable", "node", "broker", "bridge", "float"]
            },
            "group": {
                "type": "string",
                "enum": ["network", "notary", "firewall"]
            },
            "certificates": {
                "type": ["object", "null"],
                "required": ["dirs", "required"],
                "properties": {
                    "dirs": {
                        "type": "array",
                        "minItems": 1,
                        "items": { "type": "string" }
                    },
                    "required": {
                        "type": "integer",
                        "minimum": 0
                    }
                }
            },
            "process_pattern": { "type": ["string", "null"] }
        }
    })
}

/// Get JSON schema for deployment configuration validation
pub fn get_deployment_config_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": [
            "version", "root_dir", "env_file", "runtimes", "services", "nodes",
            "firewall", "subzone", "supervisor", "logging"
        ],
        "properties": {
            "version": {
                "type": "string",
                "pattern": "^[0-9]+\\.[0-9]+$"
            },
            "root_dir": { "type": "string" },
            "env_file": { "type": "string" },
            "runtimes": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["version", "executable"],
                    "properties": {
                        "version": { "type": "string" },
                        "executable": { "type": "string", "minLength": 1 }
                    }
                }
            },
            "services": {
                "type": "array",
                "items": service_entry_schema()
            },
            "nodes": {
                "type": "object",
                "required": ["template", "name_prefix", "host", "firewall_branch"],
                "properties": {
                    "template": service_entry_schema(),
                    "name_prefix": {
                        "type": "string",
                        "pattern": "^[A-Za-z][A-Za-z0-9]*$"
                    },
                    "host": { "type": "string", "minLength": 1 },
                    "firewall_branch": { "type": "string", "minLength": 1 }
                }
            },
            "firewall": {
                "type": "object",
                "required": [
                    "tmp_dir", "shared_keystore", "store_password", "source_alias",
                    "keytool", "poll_interval_secs", "settle_secs", "template_timeout_secs"
                ],
                "properties": {
                    "poll_interval_secs": { "type": "integer", "minimum": 1 },
                    "settle_secs": { "type": "integer", "minimum": 0 },
                    "template_timeout_secs": { "type": "integer", "minimum": 1 }
                }
            },
            "subzone": {
                "type": "object",
                "required": [
                    "admin_tool", "auth", "identity_manager", "signer", "network_map",
                    "setup_script", "roles_dir", "identity_manager_admin_address",
                    "signer_admin_address", "network_map_address", "network_parameters",
                    "label", "label_color"
                ],
                "properties": {
                    "admin_tool": {
                        "type": "object",
                        "required": ["dir", "program", "args", "url", "username", "password"],
                        "properties": {
                            "url": {
                                "type": "string",
                                "pattern": "^https?://"
                            },
                            "args": {
                                "type": "array",
                                "items": { "type": "string" }
                            }
                        }
                    },
                    "label_color": {
                        "type": "string",
                        "pattern": "^#[0-9A-Fa-f]{6}$"
                    }
                }
            },
            "supervisor": {
                "type": "object",
                "required": [
                    "health_check_frequency_secs", "inner_restart_delay_ms",
                    "stop_grace_secs", "straggler_poll_secs"
                ],
                "properties": {
                    "health_check_frequency_secs": { "type": "integer", "minimum": 1 },
                    "inner_restart_delay_ms": { "type": "integer", "minimum": 0 },
                    "stop_grace_secs": { "type": "integer", "minimum": 0 },
                    "straggler_poll_secs": { "type": "integer", "minimum": 1 }
                }
            },
            "logging": {
                "type": "object",
                "required": ["log_dir", "deployment_name"],
                "properties": {
                    "log_dir": { "type": "string" },
                    "deployment_name": { "type": "string", "minLength": 1 }
                }
            },
            "handoffs": {
                "type": "object",
                "required": [
                    "network_map", "notary", "network_parameters", "set_parameters_args",
                    "broker", "float", "broker_instance_marker", "poll_interval_secs"
                ],
                "properties": {
                    "set_parameters_args": {
                        "type": "array",
                        "items": { "type": "string" }
                    },
                    "broker_tool": {
                        "type": ["object", "null"],
                        "required": ["dir", "program", "args"],
                        "properties": {
                            "program": { "type": "string", "minLength": 1 },
                            "args": {
                                "type": "array",
                                "items": { "type": "string" }
                            }
                        }
                    },
                    "poll_interval_secs": { "type": "integer", "minimum": 1 }
                }
            },
            "ephemeral_paths": {
                "type": "array",
                "items": { "type": "string" }
            }
        }
    })
}
